pub mod health;

/// Expands the ":port" shorthand to an all-interfaces bind address.
pub fn bind_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_addr_expands_port_shorthand() {
        assert_eq!(bind_addr(":8000"), "0.0.0.0:8000");
        assert_eq!(bind_addr("127.0.0.1:9090"), "127.0.0.1:9090");
    }
}

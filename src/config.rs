use std::env;

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub relay_port: u16,
    pub http_port: u16,
    pub allowed_origins: Vec<String>,
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self {
            relay_port: env::var("RELAY_PORT")
                .unwrap_or_else(|_| "3001".to_string())
                .parse()
                .unwrap_or(3001),
            http_port: env::var("HTTP_PORT")
                .unwrap_or_else(|_| "3002".to_string())
                .parse()
                .unwrap_or(3002),
            allowed_origins: env::var("ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3000".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            relay_port: 3001,
            http_port: 3002,
            allowed_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

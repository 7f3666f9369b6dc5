use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    pub ssh_port: u16,
    /// Base directory holding `{owner}/{repo}.git`.
    pub repositories_path: PathBuf,
    pub db_path: PathBuf,
    /// Generated on first start if missing.
    pub ssh_host_key_path: PathBuf,
}

impl ServerConfig {
    pub fn http_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.http_port).parse()
    }

    pub fn ssh_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.ssh_port).parse()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
            ssh_port: 2222,
            repositories_path: PathBuf::from("./repositories"),
            db_path: PathBuf::from("./gatehouse.db"),
            ssh_host_key_path: PathBuf::from("./ssh_host_key"),
        }
    }
}

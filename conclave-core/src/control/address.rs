//! Control-socket address resolution

use std::fmt::Debug;
use std::path::{Path, PathBuf};

/// Maps a node name to the path of its control socket.
///
/// Both the node-side server and the supervisor's client take a resolver, so a
/// test can point a whole fleet at an isolated directory.
pub trait AddressResolver: Send + Sync + Debug {
    /// Control socket path for `node`
    fn socket_path(&self, node: &str) -> PathBuf;
}

/// Places every node's socket in one directory as `node-<name>.sock`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketDir {
    root: PathBuf,
}

impl SocketDir {
    /// Use `root` as the socket directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Per-user runtime directory, or the temp dir when there is none
    pub fn default_root() -> PathBuf {
        dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("conclave")
    }

    /// Socket directory
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Default for SocketDir {
    fn default() -> Self {
        Self::new(Self::default_root())
    }
}

impl AddressResolver for SocketDir {
    fn socket_path(&self, node: &str) -> PathBuf {
        self.root.join(format!("node-{}.sock", node))
    }
}

/// Service endpoint a node listens on for peer traffic
pub fn node_endpoint(port: u16) -> String {
    format!("http://localhost:{}/mcp", port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_dir_paths() {
        let dir = SocketDir::new("/tmp/fleet");
        assert_eq!(
            dir.socket_path("alpha"),
            PathBuf::from("/tmp/fleet/node-alpha.sock")
        );
        assert_ne!(dir.socket_path("alpha"), dir.socket_path("beta"));
    }

    #[test]
    fn test_default_root_is_namespaced() {
        assert!(SocketDir::default_root().ends_with("conclave"));
    }

    #[test]
    fn test_node_endpoint() {
        assert_eq!(node_endpoint(8001), "http://localhost:8001/mcp");
    }
}

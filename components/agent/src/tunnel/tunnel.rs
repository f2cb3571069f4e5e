// Local crates
use crate::config::config::{BeaverConfig, ConfigError};

/// Lifecycle handle for an SSH tunnel carrying transport traffic. The
/// tunnel implementation itself (key handling, port forwarding) is
/// provided by the embedding application.
pub trait SshTunnel: Send {
    fn close(&mut self);
}

/// Build the tunnel when one is configured. With no `ssh_tunnel` option
/// there is nothing to do; with one and no linked implementation the
/// startup fails loudly rather than shipping over a path the operator
/// thought was tunneled.
pub fn create_ssh_tunnel(
    config: &BeaverConfig,
) -> Result<Option<Box<dyn SshTunnel>>, ConfigError> {
    if config.beaver.ssh_tunnel.is_none() {
        return Ok(None);
    }
    Err(ConfigError::Invalid {
        option: "ssh_tunnel".to_string(),
        reason: "ssh tunnel support requires a linked implementation".to_string(),
    })
}

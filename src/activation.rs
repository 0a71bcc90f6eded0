//! On-demand service activation.
//!
//! When a request targets an identity nobody currently provides, the
//! dispatcher asks the activator to start whatever process is supposed to
//! provide it. The requester already got its error reply; activation is a
//! side effect so a retry can succeed.

use std::collections::{HashMap, HashSet};

use crate::ServiceIdentity;

/// Started services. One activation attempt per registration cycle: once
/// triggered, an identity is not activated again until it registers (and
/// possibly unregisters again).
pub trait ServiceActivator: Send {
    /// Try to bring up the provider of `identity`.
    fn activate(&mut self, identity: ServiceIdentity) -> crate::Result<()>;

    /// The identity registered; a later disappearance may activate again.
    fn service_registered(&mut self, _identity: ServiceIdentity) {}
}

/// Activator that spawns a configured command per identity.
pub struct CommandActivator {
    commands: HashMap<ServiceIdentity, Vec<String>>,
    in_flight: HashSet<ServiceIdentity>,
}

impl CommandActivator {
    pub fn new() -> Self {
        Self {
            commands: HashMap::new(),
            in_flight: HashSet::new(),
        }
    }

    /// Configure the command line that starts the provider of `identity`.
    pub fn add_command(&mut self, identity: ServiceIdentity, command: Vec<String>) {
        self.commands.insert(identity, command);
    }
}

impl Default for CommandActivator {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceActivator for CommandActivator {
    fn activate(&mut self, identity: ServiceIdentity) -> crate::Result<()> {
        if self.in_flight.contains(&identity) {
            tracing::debug!(%identity, "activation already in flight");
            return Ok(());
        }
        let Some(command) = self.commands.get(&identity) else {
            tracing::debug!(%identity, "no activation command configured");
            return Ok(());
        };
        let Some((program, args)) = command.split_first() else {
            return Err(crate::Error::config(format!(
                "empty activation command for {identity}"
            )));
        };

        tracing::info!(%identity, program = %program, "activating service");
        tokio::process::Command::new(program).args(args).spawn()?;
        self.in_flight.insert(identity);
        Ok(())
    }

    fn service_registered(&mut self, identity: ServiceIdentity) {
        self.in_flight.remove(&identity);
    }
}

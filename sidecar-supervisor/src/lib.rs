pub mod agent;
pub mod health;
pub mod launcher;
pub mod probe;
pub mod supervisor;
pub mod terminate;
pub mod workspace;

pub use agent::{AGENT_SERVICE, agent_supervisor};
pub use health::{Health, HealthCheck, HttpHealthCheck, StatusFailure};
pub use launcher::CommandLauncher;
pub use probe::{HttpPortProbe, PortProbe};
pub use supervisor::{Supervisor, SupervisorBuilder};
pub use terminate::{ListenerKiller, PortKiller, Terminator};
pub use workspace::{CONTENT_SERVICE, Workspace, WorkspaceSlot, WorkspaceSupervisor};

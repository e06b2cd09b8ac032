pub mod kill_port;
pub mod probe;

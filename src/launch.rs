/// Hands a command line to the OS without waiting for it.
pub trait Launcher {
    fn launch(&self, command_line: &str, working_dir: Option<&str>) -> Result<(), LaunchError>;
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("empty command line")]
    EmptyCommand,
    #[error("failed to start `{command}`: {message}")]
    Os { command: String, message: String },
}

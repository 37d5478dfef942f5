use std::error::Error;

use enum_uninstall::config::Config;
use log::debug;
use simple_logger::SimpleLogger;

fn main() -> Result<(), Box<dyn Error>> {
    let config = Config::load()?;
    SimpleLogger::new().with_level(config.level_filter()).init()?;
    debug!("{:?}", config);

    let mut args = std::env::args().skip(1);
    // No action at all shows the usage.
    let action = args.next().unwrap_or_else(|| "help".to_string());
    let params: Vec<String> = args.collect();

    run(&config, &action, &params)
}

#[cfg(windows)]
fn run(config: &Config, action: &str, params: &[String]) -> Result<(), Box<dyn Error>> {
    use enum_uninstall::actions::Session;
    use enum_uninstall::platform::{ProcessLauncher, WindowsRegistry};

    let registry = WindowsRegistry;
    let launcher = ProcessLauncher;
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut input = stdin.lock();
    let mut output = stdout.lock();

    let mut session = Session::new(&registry, &launcher, config, &mut input, &mut output);
    session.dispatch(action, params)
}

#[cfg(not(windows))]
fn run(_config: &Config, action: &str, _params: &[String]) -> Result<(), Box<dyn Error>> {
    Err(format!("cannot run '{}': the uninstall list lives in the Windows registry", action).into())
}

use std::{
    error::Error,
    io::{self, Write},
    process,
    sync::Arc,
    time::Duration,
};

use clap::Parser;
use log::info;

use hotrod::{
    ConfigurationBuilder, RemoteCacheManager,
    cli::{Command, CommandError, execute, prompt},
    configuration::ExhaustedAction,
};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Servers to connect to, as `host[:port];host[:port]`
    #[arg(short, long, default_value = "127.0.0.1:11222")]
    servers: String,
    /// Cache to operate on; empty for the server's default cache
    #[arg(short, long, default_value = "")]
    cache: String,
    /// Hot Rod protocol version (1.0, 1.1 or 1.2)
    #[arg(long, default_value = "1.2")]
    protocol_version: String,
    /// Connect timeout in milliseconds, 0 for none
    #[arg(long, default_value_t = 60_000)]
    connect_timeout: u64,
    /// Socket read/write timeout in milliseconds, 0 for none
    #[arg(long, default_value_t = 60_000)]
    socket_timeout: u64,
    /// Maximum connections per server, -1 for unbounded
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    max_active: i32,
    /// Fail instead of waiting when the pool is exhausted
    #[arg(long)]
    fail_when_exhausted: bool,
    /// Ask writes to return the previous value
    #[arg(long)]
    force_return_values: bool,
    /// Skip pinging the servers on startup
    #[arg(long)]
    no_ping: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize env_logger; For logging to STDOUT/STDERR
    env_logger::init();

    let cli = Cli::parse();
    let exhausted_action = if cli.fail_when_exhausted {
        ExhaustedAction::Fail
    } else {
        ExhaustedAction::Wait
    };
    let config = ConfigurationBuilder::new()
        .add_servers(&cli.servers)
        .protocol_version(cli.protocol_version)
        .connection_timeout(Duration::from_millis(cli.connect_timeout))
        .socket_timeout(Duration::from_millis(cli.socket_timeout))
        .force_return_values(cli.force_return_values)
        .ping_on_startup(!cli.no_ping)
        .connection_pool(|p| p.max_active(cli.max_active).exhausted_action(exhausted_action))
        .build()?;

    let manager = Arc::new(RemoteCacheManager::new(config, true)?);
    let cache = manager.cache(&cli.cache)?;

    let handler_manager = Arc::clone(&manager);
    ctrlc::set_handler(move || {
        info!("interrupted, closing connections");
        handler_manager.stop();
        process::exit(130);
    })?;

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        let command = match prompt(stdin.lock(), &mut stdout) {
            Ok(command) => command,
            Err(CommandError::Io(e)) => return Err(e.into()),
            Err(e) => {
                eprintln!("error: {e}");
                continue;
            }
        };

        if command == Command::Exit {
            break;
        }

        match execute(&cache, &command) {
            Ok(Some(out)) => writeln!(stdout, "{out}")?,
            Ok(None) => {}
            Err(e) => eprintln!("error: {e}"),
        }
    }

    manager.stop();
    Ok(())
}

use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{ArgAction, Parser};
use postern::{
    AcceptAll, MemoryStore, RecipientValidator, Shutdown, SmtpConfig, SmtpLimits, SmtpServer,
};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};

/// Single-recipient SMTP intake server
#[derive(Debug, Parser, PartialEq)]
#[command(about, version)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:2525")]
    addr: String,

    /// Hostname announced in the greeting and HELO/EHLO replies
    #[arg(long, default_value = "postern.local")]
    hostname: String,

    /// Accept mail for this address; repeat for more. Without any, every recipient is accepted
    #[arg(short, long = "recipient", value_name = "ADDRESS")]
    recipients: Vec<String>,

    /// Largest message body accepted, in bytes
    #[arg(long, default_value_t = SmtpLimits::MAX_DATA_SIZE)]
    max_message_size: usize,

    /// Seconds a client may stay silent before being dropped, 0 waits forever
    #[arg(long, default_value_t = 300)]
    timeout_secs: u64,

    /// Keep the connection open after rejecting an unknown recipient
    #[arg(long)]
    keep_open_on_unknown: bool,

    /// More logging, repeat for more detail
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn config(&self) -> SmtpConfig {
        let read_timeout = (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs));

        SmtpConfig::new(&self.hostname)
            .with_max_message_size(self.max_message_size)
            .with_read_timeout(read_timeout)
            .with_close_on_unknown_recipient(!self.keep_open_on_unknown)
    }

    fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }
}

/// Trigger `shutdown` on SIGINT or SIGTERM
fn watch_signals(shutdown: Shutdown) -> std::io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    thread::Builder::new()
        .name("signals".to_owned())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!(signal, "received termination signal");
                shutdown.trigger();
            }
        })?;

    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .init();

    let store = Arc::new(MemoryStore::with_users(&args.recipients));
    let validator: Arc<dyn RecipientValidator> = if args.recipients.is_empty() {
        info!("no recipients configured, accepting mail for everyone");
        Arc::new(AcceptAll)
    } else {
        store.clone()
    };

    let server = SmtpServer::with_config(args.config(), validator, store.clone());

    if let Err(e) = watch_signals(server.shutdown_handle()) {
        error!(error = %e, "could not install signal handlers");
        return ExitCode::FAILURE;
    }

    match server.start(&args.addr) {
        Ok(()) => {
            info!(messages = store.len(), "server stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(addr = %args.addr, error = %e, "failed to start server");
            ExitCode::FAILURE
        }
    }
}

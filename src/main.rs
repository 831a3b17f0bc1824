//! nfregex: regex firewall for NFQUEUE'd traffic
//!
//! Entry point for the production filter. The process is meant to be
//! launched and driven by a supervisor over stdio; see the crate docs
//! for the protocol.
//!
//! ```bash
//! iptables -t mangle -A PREROUTING -p tcp --dport 4000 \
//!     -j NFQUEUE --queue-num 1000
//! NFREGEX_NTHREADS=4 ./nfregex
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use nfregex::config::Config;
use nfregex::control;
use nfregex::engine::{RegexEngineFactory, RulesetHandle};
use nfregex::queue::{NfqTransport, Transport};
use nfregex::worker::FilterPool;

/// Initialize logging to stderr; stdout belongs to the control protocol.
fn init_logging() {
    let filter = EnvFilter::from_default_env().add_directive(Level::INFO.into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_logging();
    info!(version = nfregex::VERSION, "nfregex starting");

    let config = Config::from_env().context("invalid configuration")?;
    let shutdown = Arc::new(AtomicBool::new(false));

    let transport =
        NfqTransport::open(&config, Arc::clone(&shutdown)).context("failed to bind nfqueue")?;
    control::announce_queue(std::io::stdout().lock(), transport.queue_num())
        .context("control channel unusable")?;

    let rules = Arc::new(RulesetHandle::new());
    let factory = RegexEngineFactory::new(Arc::clone(&rules), config.match_mode);
    let pool = FilterPool::spawn(&factory, transport.sink(), config.workers, config.fail_open);

    // Ruleset updates arrive on stdin until the supervisor goes away.
    let updater = {
        let rules = Arc::clone(&rules);
        let shutdown = Arc::clone(&shutdown);
        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            // Stdout must be locked per write, not for the whole loop:
            // workers print BLOCKED lines on it too.
            let result = control::serve(stdin.lock(), std::io::stdout(), &rules);
            if let Err(e) = &result {
                error!(error = %e, "control channel failed");
            }
            shutdown.store(true, Ordering::Relaxed);
        })
    };

    match pool.run(transport) {
        Ok(()) => {
            // The only orderly path here is the supervisor closing stdin,
            // and an unsupervised filter must not keep running.
            let _ = updater.join();
            bail!("control channel closed, shutting down")
        }
        Err(e) => {
            // The updater thread may still be blocked on stdin; the
            // process is exiting either way.
            error!(error = %e, "queue transport failed");
            Err(e.into())
        }
    }
}

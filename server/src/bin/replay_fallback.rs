//! Reads a score fallback log and prints or resubmits its records.

use clap::Parser;
use log::{error, info, warn};
use server::fallback::FallbackReader;
use server::rpc::{DatabaseClient, TcpTransport};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about = "Replay score writes recorded in a fallback log")]
struct Args {
    /// Fallback log to read
    log: String,

    /// Resubmit every record to the score database at this address
    #[arg(long)]
    database: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let reader = FallbackReader::open(&args.log)?;
    let db = args
        .database
        .as_deref()
        .map(|addr| DatabaseClient::new(Arc::new(TcpTransport::spawn(addr))));

    let mut replayed = 0usize;
    let mut failed = 0usize;

    for (index, record) in reader.enumerate() {
        let request = match record {
            Ok(request) => request,
            Err(e) => {
                warn!("Stopping at record {}: {}", index, e);
                break;
            }
        };

        let Some(db) = &db else {
            println!("{:>5} {:<22} {:?}", index, request.verb(), request);
            continue;
        };

        let verb = request.verb();
        match db.resubmit(request).await {
            Ok(Ok(_)) => {
                info!("Record {} ({}) accepted", index, verb);
                replayed += 1;
            }
            Ok(Err(e)) => {
                error!("Record {} ({}) rejected: {}", index, verb, e);
                failed += 1;
            }
            Err(_) => {
                error!("Record {} ({}) lost: connection closed", index, verb);
                failed += 1;
            }
        }
    }

    if db.is_some() {
        println!("Replayed {} records, {} failed", replayed, failed);
        if failed > 0 {
            return Err(format!("{} records could not be replayed", failed).into());
        }
    }

    Ok(())
}

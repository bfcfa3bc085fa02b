use std::io::Read;

use clap::Args;
use supervisor::SupervisorResult;

use super::QueueSource;

#[derive(Args, Debug)]
pub struct PushArgs {
    /// Queue key to push onto
    #[arg(long, short)]
    key: String,
    #[command(flatten)]
    source: QueueSource,
    /// Job payload; read from stdin when omitted
    payload: Option<String>,
}

/// Enqueue a single job.
pub fn run_push(args: PushArgs) -> SupervisorResult<()> {
    let payload = match args.payload {
        Some(payload) => payload.into_bytes(),
        None => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf)?;
            buf
        }
    };
    let mut queue = args.source.open(std::slice::from_ref(&args.key))?;
    queue.enqueue(&args.key, &payload)?;
    Ok(())
}

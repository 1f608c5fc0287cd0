//! Operator replay tool.
//!
//! Finds routed leads with no successful delivery attempt and no queued job
//! (retry-exhausted or orphaned by a crash) and re-enqueues them for the
//! delivery workers.

use anyhow::Result;
use clap::Parser;

use leadgen_backend::store::{now_ms, Db};

#[derive(Parser, Debug)]
#[command(name = "leadgen-replay", about = "Re-enqueue undelivered routed leads")]
struct Args {
    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "./leadgen.db")]
    database_path: String,

    /// Maximum number of leads to re-enqueue in one run
    #[arg(long, default_value_t = 100)]
    limit: i64,

    /// List the leads without enqueueing anything
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let db = Db::open(&args.database_path)?;

    let leads = db.routed_undelivered(args.limit)?;
    if leads.is_empty() {
        println!("nothing to replay");
        return Ok(());
    }

    for lead_id in &leads {
        if args.dry_run {
            println!("would re-enqueue lead {}", lead_id);
        } else {
            db.enqueue_delivery(*lead_id, 0, now_ms())?;
            println!("re-enqueued lead {}", lead_id);
        }
    }

    println!(
        "{} lead(s) {}",
        leads.len(),
        if args.dry_run { "found" } else { "re-enqueued" }
    );
    Ok(())
}

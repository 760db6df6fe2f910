use std::path::PathBuf;
use std::time::Duration;

use log::info;
use structopt::StructOpt;

use mapred::Coordinator;

#[derive(StructOpt, Debug)]
#[structopt(name = env!("CARGO_PKG_NAME"), version = env!("CARGO_PKG_VERSION"), about = env!("CARGO_PKG_DESCRIPTION"), author = env!("CARGO_PKG_AUTHORS"))]
struct Opt {
    /// Port to start the coordinator server on
    #[structopt(short, long)]
    port: u16,

    /// Seconds an assigned task may run before it is reverted for reassignment
    #[structopt(short, long, default_value = "20")]
    grace: u64,

    /// Directory holding intermediate and output files
    #[structopt(short, long, default_value = "target", parse(from_os_str))]
    dir: PathBuf,

    /// Number of reduce tasks
    #[structopt(long, default_value = "10")]
    nreduce: usize,

    /// Files to process, one Map task each
    #[structopt(name = "FILE", parse(from_os_str))]
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();

    let opt = Opt::from_args();
    let coordinator = Coordinator::new(
        opt.files,
        opt.nreduce,
        &opt.dir,
        opt.port,
        Duration::from_secs(opt.grace),
    );
    tokio::select! {
        res = coordinator.serve() => res?,
        _ = coordinator.wait_done() => info!("job complete, shutting down"),
    }
    Ok(())
}

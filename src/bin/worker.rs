use std::path::PathBuf;

use structopt::StructOpt;

use mapred::app::wc;
use mapred::Worker;

#[derive(StructOpt, Debug)]
#[structopt(name = env!("CARGO_PKG_NAME"), version = env!("CARGO_PKG_VERSION"), about = env!("CARGO_PKG_DESCRIPTION"), author = env!("CARGO_PKG_AUTHORS"))]
struct Opt {
    /// Coordinator address, e.g. 127.0.0.1:9999
    #[structopt(short, long)]
    server: String,

    /// Directory holding input, intermediate, and output files
    #[structopt(short, long, default_value = "target", parse(from_os_str))]
    dir: PathBuf,

    /// Seconds to sleep between polls when no task is available
    #[structopt(short, long, default_value = "1")]
    poll: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let opt = Opt::from_args();
    let worker = Worker {
        dir: opt.dir,
        server: opt.server,
        poll: opt.poll,
        map: wc::map,
        reduce: wc::reduce,
    };
    worker.launch().await
}

//! Single-process reference runner. Produces the same `mr-out-*` files the
//! distributed pipeline would, useful for checking a workload without
//! standing up a coordinator.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use structopt::StructOpt;

use mapred::app::wc::{map, reduce};
use mapred::store;

#[derive(StructOpt, Debug)]
#[structopt(name = env!("CARGO_PKG_NAME"), version = env!("CARGO_PKG_VERSION"), about = env!("CARGO_PKG_DESCRIPTION"), author = env!("CARGO_PKG_AUTHORS"))]
struct Opt {
    /// Directory to write output files into
    #[structopt(short, long, default_value = "target", parse(from_os_str))]
    dir: PathBuf,

    /// Number of output partitions
    #[structopt(long, default_value = "10")]
    nreduce: usize,

    /// Files to process
    #[structopt(name = "FILE", parse(from_os_str))]
    files: Vec<PathBuf>,
}

fn main() -> Result<()> {
    pretty_env_logger::init();

    let opt = Opt::from_args();
    let mut grouped = HashMap::<String, Vec<String>>::new();
    for fname in &opt.files {
        let contents = fs::read_to_string(fname)
            .with_context(|| format!("cannot read {}", fname.display()))?;
        for kv in map(fname, &contents) {
            grouped.entry(kv.key).or_default().push(kv.value);
        }
    }

    let mut outputs: Vec<Vec<(String, String)>> = vec![Vec::new(); opt.nreduce];
    for (key, values) in &grouped {
        let r = store::partition(key, opt.nreduce);
        outputs[r].push((key.clone(), reduce(key, values)));
    }
    for (r, mut groups) in outputs.into_iter().enumerate() {
        groups.sort();
        store::write_output(&store::output_path(&opt.dir, r), &groups)?;
    }
    Ok(())
}

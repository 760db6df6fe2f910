use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, trace};
use tarpc::{client, context, tokio_serde::formats::Json};

use crate::store;
use crate::{KeyValue, MapFn, ReduceFn, ServiceClient, Task, TaskKind};

/// One worker process. Polls the coordinator for tasks and runs the injected
/// map and reduce functions against files under `dir`. Every RPC is its own
/// round trip on a fresh connection; a failed connection means the
/// coordinator is gone or finished, and the worker stops.
pub struct Worker {
    /// Directory holding input, intermediate, and output files. Must be the
    /// same filesystem location the coordinator was configured with.
    pub dir: PathBuf,
    /// Coordinator address, e.g. `127.0.0.1:9999`.
    pub server: String,
    /// Seconds to sleep before polling again when told to wait.
    pub poll: u64,
    pub map: MapFn,
    pub reduce: ReduceFn,
}

impl Worker {
    pub async fn launch(&self) -> Result<()> {
        loop {
            let reply = match self.request().await {
                Ok(reply) => reply,
                Err(e) => {
                    debug!("coordinator unreachable, stopping: {:#}", e);
                    break;
                }
            };
            let task = match reply {
                Some(task) => task,
                None => {
                    info!("no more work, stopping");
                    break;
                }
            };
            match task.kind {
                TaskKind::Map => {
                    self.run_map(&task)?;
                    self.finish(task).await;
                }
                TaskKind::Reduce => {
                    self.run_reduce(&task)?;
                    self.finish(task).await;
                }
                TaskKind::Wait => tokio::time::sleep(Duration::from_secs(self.poll)).await,
            }
        }
        Ok(())
    }

    /// Read the input unit, run the map function, and scatter the records
    /// into one bucket file per reducer. Every bucket is written, empty ones
    /// included, so reducers never see a missing location.
    fn run_map(&self, task: &Task) -> Result<()> {
        let input = task
            .map_input
            .as_ref()
            .context("map task carries no input file")?;
        info!("map {}: {}", task.index, input.display());
        let contents = fs::read_to_string(input)
            .with_context(|| format!("cannot read {}", input.display()))?;
        let records = (self.map)(input, &contents);

        let mut buckets: Vec<Vec<KeyValue>> = vec![Vec::new(); task.nreduce];
        for kv in records {
            buckets[store::partition(&kv.key, task.nreduce)].push(kv);
        }
        for (r, bucket) in buckets.iter().enumerate() {
            store::write_records(&store::intermediate_path(&self.dir, task.index, r), bucket)?;
        }
        Ok(())
    }

    /// Gather this partition's records from every map task, sort them so
    /// equal keys form maximal runs, and reduce one run at a time into a
    /// `key value` output line, in ascending key order.
    fn run_reduce(&self, task: &Task) -> Result<()> {
        info!("reduce {}: {} inputs", task.index, task.reduce_inputs.len());
        let mut records = Vec::new();
        for path in &task.reduce_inputs {
            records.extend(store::read_records(path)?);
        }
        records.sort();

        let mut groups = Vec::new();
        let mut i = 0;
        while i < records.len() {
            let mut j = i + 1;
            while j < records.len() && records[j].key == records[i].key {
                j += 1;
            }
            let values: Vec<String> = records[i..j].iter().map(|kv| kv.value.clone()).collect();
            let output = (self.reduce)(&records[i].key, &values);
            groups.push((records[i].key.clone(), output));
            i = j;
        }
        store::write_output(&store::output_path(&self.dir, task.index), &groups)
    }

    async fn connect(&self) -> Result<ServiceClient> {
        let transport = tarpc::serde_transport::tcp::connect(&self.server, Json::default).await?;
        Ok(ServiceClient::new(client::Config::default(), transport).spawn())
    }

    async fn request(&self) -> Result<Option<Task>> {
        let client = self.connect().await?;
        Ok(client.request(context::current()).await?)
    }

    /// Report completion. A report that cannot be delivered is dropped; the
    /// coordinator's timeout will hand the task to someone else, and the
    /// next `request` detects whether the coordinator is gone.
    async fn finish(&self, task: Task) {
        let (kind, index) = (task.kind, task.index);
        let result = async {
            let client = self.connect().await?;
            client.finish(context::current(), task).await??;
            Ok::<(), anyhow::Error>(())
        }
        .await;
        match result {
            Ok(()) => trace!("reported {:?} task {} finished", kind, index),
            Err(e) => debug!("could not report {:?} task {}: {:#}", kind, index, e),
        }
    }
}

use std::{
    error::Error,
    io::{self, Write},
    mem,
    sync::mpsc::{Receiver, Sender},
};

use tracing::{debug, warn};

use crate::updater::Operator;

/// Feeds input lines to an operator batch by batch and writes its results as JSON lines.
///
/// Each batch is a transaction, numbered from 1. Malformed lines are dropped.
pub struct Streamer<In, Out> {
    lines: In,
    write: Out,
    batch_size: usize,
}

impl<In, Out, Err> Streamer<In, Out>
where
    In: Iterator<Item = Result<String, Err>>,
    Out: FnMut(String) -> Result<(), Box<dyn Error>>,
    Err: Into<Box<dyn Error>>,
{
    pub fn new(lines: In, write: Out, batch_size: usize) -> Self {
        Self {
            lines,
            write,
            batch_size: batch_size.max(1),
        }
    }

    /// Runs until the input is exhausted. A trailing incomplete batch is processed as well.
    ///
    /// Returns the number of processed transactions.
    pub fn run<Op: Operator>(
        streamer: Streamer<In, Out>,
        operator: &mut Op,
    ) -> Result<u64, Box<dyn Error>> {
        let Streamer {
            lines,
            mut write,
            batch_size,
        } = streamer;
        let mut tx_id = 0;
        let mut batch = Vec::with_capacity(batch_size);
        for input in lines {
            let line = input.map_err(Into::into)?;
            if line.trim().is_empty() {
                continue;
            }
            match operator.parse(&line) {
                Ok(parsed) => batch.push(parsed),
                Err(reason) => warn!(%reason, "dropping input"),
            }
            if batch.len() >= batch_size {
                tx_id += 1;
                process(operator, tx_id, mem::take(&mut batch), &mut write)?;
            }
        }
        if !batch.is_empty() {
            tx_id += 1;
            process(operator, tx_id, batch, &mut write)?;
        }
        Ok(tx_id)
    }
}

fn process<Op: Operator>(
    operator: &mut Op,
    tx_id: u64,
    batch: Vec<Op::Input>,
    write: &mut impl FnMut(String) -> Result<(), Box<dyn Error>>,
) -> Result<(), Box<dyn Error>> {
    debug!(tx_id, size = batch.len(), "processing batch");
    for output in operator.process_batch(tx_id, batch) {
        write(serde_json::to_string(&output)?)?;
    }
    Ok(())
}

/// Reads lines from the standard input and writes results to the standard output.
pub fn stdio() -> (
    impl Iterator<Item = Result<String, io::Error>>,
    impl FnMut(String) -> Result<(), Box<dyn Error>>,
) {
    let lines = io::stdin().lines();
    let write = |result: String| -> Result<(), Box<dyn Error>> {
        writeln!(io::stdout().lock(), "{}", result)?;
        Ok(())
    };
    (lines, write)
}

/// Reads lines from a channel and sends results to another.
pub fn channels(
    line_receiver: Receiver<String>,
    result_producer: Sender<String>,
) -> (
    impl Iterator<Item = Result<String, Box<dyn Error>>>,
    impl FnMut(String) -> Result<(), Box<dyn Error>>,
) {
    let lines = line_receiver.into_iter().map(Ok);
    let write = move |result: String| -> Result<(), Box<dyn Error>> {
        result_producer.send(result)?;
        Ok(())
    };
    (lines, write)
}

//! Per-family job runner.
//!
//! Jobs are materialised to a command file, sorted by decreasing cost
//! (approximate tree size) for load balancing, and either run in-process
//! over this rank's contiguous slice or fanned out as one worker process
//! per family (the split implementation). Worker exit codes convey
//! success; a failing fatal job tears the run down.

use crate::errors::SchedulerError;
use crate::parallel::Comm;
use anyhow::{Context, Result};
use log::*;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::Command;

#[derive(Clone, Debug)]
pub struct Job {
    pub name: String,
    pub cores: usize,
    pub cost: usize,
    pub args: Vec<String>,
}

pub fn write_command_file(jobs: &[Job], path: &Path) -> Result<()> {
    let mut out = File::create(path)?;
    for job in jobs {
        writeln!(out, "{} {} {} {}", job.name, job.cores, job.cost, job.args.join(" "))?;
    }
    Ok(())
}

pub fn read_command_file(path: &Path) -> Result<Vec<Job>> {
    let file = File::open(path)
        .with_context(|| format!("while opening command file {}", path.display()))?;
    let mut jobs = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let mut fields = line.split_whitespace().map(|s| s.to_string());
        let name = match fields.next() {
            Some(name) => name,
            None => continue,
        };
        let cores = fields.next().and_then(|s| s.parse().ok()).unwrap_or(1);
        let cost = fields.next().and_then(|s| s.parse().ok()).unwrap_or(1);
        jobs.push(Job { name, cores, cost, args: fields.collect() });
    }
    Ok(jobs)
}

/// Run every job exactly once. `runner` is the in-process implementation;
/// the split implementation re-invokes this executable's `family-worker`
/// entry point on the command file, one process per job.
pub fn run_jobs<F>(
    comm: &Comm,
    jobs: &mut [Job],
    command_file: &Path,
    fatal: bool,
    mut runner: F,
) -> Result<()>
where
    F: FnMut(&Job) -> Result<()>,
{
    jobs.sort_by(|a, b| b.cost.cmp(&a.cost).then_with(|| a.name.cmp(&b.name)));
    write_command_file(jobs, command_file)?;
    comm.barrier();
    let mut failed = 0;
    if comm.allow_split() {
        let exe = std::env::current_exe().context("while resolving the worker executable")?;
        for job in jobs.iter() {
            let status = Command::new(&exe)
                .arg("family-worker")
                .arg("--command-file")
                .arg(command_file)
                .arg("--name")
                .arg(&job.name)
                .status()
                .with_context(|| format!("while spawning the worker for {}", job.name))?;
            if !status.success() {
                let code = status.code().unwrap_or(-1);
                warn!("{}", SchedulerError::JobFailed { name: job.name.clone(), code });
                if fatal {
                    comm.abort(if code > 0 { code } else { 20 });
                }
                failed += 1;
            }
        }
    } else {
        let (begin, end) = comm.begin_end(jobs.len());
        for job in jobs.iter().take(end).skip(begin) {
            if let Err(error) = runner(job) {
                warn!("family job {} failed: {:#}", job.name, error);
                if fatal {
                    comm.abort(20);
                }
                failed += 1;
            }
        }
    }
    comm.barrier();
    if failed * 2 > jobs.len().max(1) {
        return Err(SchedulerError::FailureBudgetExceeded { failed, total: jobs.len() }.into());
    }
    Ok(())
}

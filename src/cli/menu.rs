//! Interactive front-end for strategy selection. It only produces a
//! `Strategy`; nothing runs from here.

use std::io::{BufRead, Write};
use crate::config::defs::PipelineError;
use crate::pipelines::batch::{Allocation, Strategy};

const MENU: &str = "\
Select a scheduling strategy:
  1) maximum-parallelism  (one job per sample)
  2) balanced             (3 jobs)
  3) speed-priority       (2 jobs)
  4) custom
  5) exit
";

fn read_line<R: BufRead>(input: &mut R) -> Result<Option<String>, PipelineError> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

fn prompt_positive<R: BufRead, W: Write>(input: &mut R, output: &mut W, label: &str) -> Result<usize, PipelineError> {
    loop {
        write!(output, "{}: ", label)?;
        output.flush()?;
        let Some(line) = read_line(input)? else {
            return Err(PipelineError::Usage(format!("No value given for {}", label)));
        };
        match line.parse::<usize>() {
            Ok(value) if value > 0 => return Ok(value),
            _ => writeln!(output, "Please enter a positive whole number.")?,
        }
    }
}

/// Shows the menu until a valid choice is made.
///
/// # Returns
/// The chosen strategy, or None for exit (or end of input).
pub fn choose_strategy<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    sample_count: usize,
    budget: usize,
) -> Result<Option<Strategy>, PipelineError> {
    writeln!(output, "{} sample(s), {} thread(s) available", sample_count, budget)?;
    loop {
        write!(output, "{}> ", MENU)?;
        output.flush()?;
        let Some(choice) = read_line(input)? else { return Ok(None) };
        let strategy = match choice.as_str() {
            "1" => Strategy::MaximumParallelism,
            "2" => Strategy::Balanced,
            "3" => Strategy::SpeedPriority,
            "4" => {
                let jobs = prompt_positive(input, output, "Concurrent jobs")?;
                let threads = prompt_positive(input, output, "Threads per job")?;
                Strategy::custom(jobs, threads)?
            }
            "5" => return Ok(None),
            other => {
                writeln!(output, "Unknown choice '{}'", other)?;
                continue;
            }
        };
        return Ok(Some(strategy));
    }
}

/// Asks whether to run an oversubscribed allocation. Anything but yes declines.
pub fn confirm_oversubscription<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    allocation: &Allocation,
) -> Result<bool, PipelineError> {
    write!(
        output,
        "WARNING: {} jobs x {} threads = {} threads exceeds the budget of {}. Continue? [y/N] ",
        allocation.max_concurrent_jobs,
        allocation.threads_per_job,
        allocation.requested_threads(),
        allocation.budget
    )?;
    output.flush()?;
    let answer = read_line(input)?.unwrap_or_default().to_lowercase();
    Ok(answer == "y" || answer == "yes")
}

//! Stdio control protocol
//!
//! The supervisor talks to the filter over plain pipes:
//!
//! - On startup the filter prints `QUEUE <n>` with the queue number it
//!   bound, so the supervisor can install the matching firewall rules.
//! - Every line on stdin is a complete replacement ruleset
//!   (whitespace-separated rule tokens; an empty line clears all rules).
//!   Each line is answered with `ACK OK` or `ACK FAIL <reason>`.
//! - Whenever a rule fires, `BLOCKED <token>` is printed.
//!
//! Stdin closing means the supervisor is gone; the filter must not keep
//! running unsupervised with a frozen ruleset.

use std::io::{BufRead, Write};

use tracing::{error, info};

use crate::engine::RulesetHandle;

/// Print the startup banner naming the bound queue.
///
/// # Errors
///
/// Propagates write failures on the control channel.
pub fn announce_queue<W: Write>(mut output: W, queue_num: u16) -> std::io::Result<()> {
    writeln!(output, "QUEUE {queue_num}")?;
    output.flush()
}

/// Serve ruleset updates until the control channel reaches EOF.
///
/// Reload failures are reported to the supervisor and logged; the
/// previous ruleset stays live and serving continues.
///
/// # Errors
///
/// Propagates read/write failures on the control channel.
pub fn serve<R: BufRead, W: Write>(
    input: R,
    mut output: W,
    rules: &RulesetHandle,
) -> std::io::Result<()> {
    for line in input.lines() {
        let line = line?;
        match rules.reload(&line) {
            Ok((count, version)) => {
                info!(rules = count, version, "ruleset reloaded");
                writeln!(output, "ACK OK")?;
            }
            Err(e) => {
                error!(error = %e, "ruleset reload refused");
                writeln!(output, "ACK FAIL {e}")?;
            }
        }
        output.flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn run(input: &str, rules: &RulesetHandle) -> String {
        let mut output = Vec::new();
        serve(Cursor::new(input.to_string()), &mut output, rules).unwrap();
        String::from_utf8(output).unwrap()
    }

    #[test]
    fn test_banner() {
        let mut out = Vec::new();
        announce_queue(&mut out, 1001).unwrap();
        assert_eq!(out, b"QUEUE 1001\n");
    }

    #[test]
    fn test_ack_ok_and_fail() {
        let rules = RulesetHandle::new();
        let good = format!("1C{}\n", hex::encode("bad_pattern"));
        let output = run(&good, &rules);
        assert_eq!(output, "ACK OK\n");
        assert_eq!(rules.snapshot().rule_count(), 1);

        let output = run("1Cnothex\n", &rules);
        assert!(output.starts_with("ACK FAIL "));
        // Previous ruleset survives a failed reload.
        assert_eq!(rules.snapshot().rule_count(), 1);
    }

    #[test]
    fn test_each_line_is_full_replacement() {
        let rules = RulesetHandle::new();
        let input = format!(
            "1C{}\n1S{}\n\n",
            hex::encode("one"),
            hex::encode("two")
        );
        let output = run(&input, &rules);
        assert_eq!(output, "ACK OK\nACK OK\nACK OK\n");
        // Last line was empty: all rules cleared.
        assert_eq!(rules.snapshot().rule_count(), 0);
    }
}

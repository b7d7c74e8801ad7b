use crate::common::manager::common::format_duration;
use crate::common::utils::time::parse_slurm_time;
use std::time::Duration;

/// Format a duration as a Slurm time string, e.g. 01:05:02 or 1-00:00:00
pub fn format_slurm_duration(duration: &Duration) -> String {
    format_duration(duration)
}

/// Finds the job id in the output of `sbatch`.
pub fn parse_sbatch_output(output: &str) -> anyhow::Result<String> {
    output
        .lines()
        .map(|l| l.trim())
        .find(|l| l.to_lowercase().starts_with("submitted batch job"))
        .and_then(|l| l.split(' ').nth(3))
        .map(|l| l.to_string())
        .ok_or_else(|| anyhow::anyhow!("Missing job id in sbatch output\n{output}"))
}

/// One row of `squeue -o '%i|%j|%T|%M|%N'` or
/// `sacct -P -o JobID,JobName,State,Elapsed,NodeList`.
#[derive(Debug, Clone, PartialEq)]
pub struct SlurmJobRow {
    pub job_id: String,
    pub name: String,
    pub state: String,
    pub elapsed: Option<Duration>,
    pub node: Option<String>,
}

fn parse_job_row(line: &str) -> anyhow::Result<SlurmJobRow> {
    let fields: Vec<&str> = line.trim().split('|').collect();
    if fields.len() < 5 {
        anyhow::bail!("Expected 5 columns, found {}: `{line}`", fields.len());
    }
    // The job name may itself contain the separator.
    let count = fields.len();
    let job_id = fields[0].trim();
    if job_id.is_empty() {
        anyhow::bail!("Missing job id: `{line}`");
    }
    let state = fields[count - 3].trim();
    if state.is_empty() {
        anyhow::bail!("Missing job state: `{line}`");
    }
    Ok(SlurmJobRow {
        job_id: job_id.to_string(),
        name: fields[1..count - 3].join("|"),
        state: state.to_string(),
        elapsed: parse_slurm_time(fields[count - 2].trim()).ok(),
        node: first_host(fields[count - 1]),
    })
}

/// Parses every row of the tabular output of `squeue`/`sacct`.
pub fn parse_job_list(output: &str) -> anyhow::Result<Vec<SlurmJobRow>> {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(parse_job_row)
        .collect()
}

/// Parses the tabular output of `squeue`/`sacct` and returns the row of the given job.
///
/// Returns `Ok(None)` when the output contains no row of that job.
pub fn parse_job_table(output: &str, job_id: &str) -> anyhow::Result<Option<SlurmJobRow>> {
    Ok(parse_job_list(output)?
        .into_iter()
        .find(|row| row.job_id == job_id))
}

/// Returns the first host of a compressed Slurm host list.
///
/// `mel[2001-2003]` → `mel2001`, `a[07,09],b1` → `a07`.
/// Empty lists, `(null)` and `None assigned` yield `None`.
pub fn first_host(hostlist: &str) -> Option<String> {
    let hostlist = hostlist.trim();
    if hostlist.is_empty() || hostlist == "(null)" || hostlist.starts_with("None") {
        return None;
    }

    let mut depth = 0;
    let end = hostlist
        .char_indices()
        .find(|&(_, c)| {
            match c {
                '[' => depth += 1,
                ']' => depth -= 1,
                ',' if depth == 0 => return true,
                _ => {}
            }
            false
        })
        .map(|(index, _)| index)
        .unwrap_or(hostlist.len());
    let host = &hostlist[..end];

    let Some(open) = host.find('[') else {
        return Some(host.to_string());
    };
    let close = host[open..].find(']').map(|c| open + c)?;
    let first = host[open + 1..close]
        .split(',')
        .next()
        .and_then(|range| range.split('-').next())
        .unwrap_or_default();
    let rest = &host[close + 1..];
    let rest = if rest.is_empty() {
        String::new()
    } else {
        first_host(rest).unwrap_or_default()
    };
    Some(format!("{}{first}{rest}", &host[..open]))
}

#[cfg(test)]
mod test {
    use super::{
        first_host, format_slurm_duration, parse_job_list, parse_job_table, parse_sbatch_output,
    };
    use std::time::Duration;

    #[test]
    fn test_format_slurm_duration() {
        assert_eq!(
            format_slurm_duration(&Duration::from_secs(3600 * 2 + 5)),
            "02:00:05"
        );
    }

    #[test]
    fn test_parse_sbatch_output() {
        assert_eq!(
            parse_sbatch_output("Submitted batch job 42\n").unwrap(),
            "42"
        );
        assert_eq!(
            parse_sbatch_output("sbatch: info: using account x\nSubmitted batch job 1234567")
                .unwrap(),
            "1234567"
        );
    }

    #[test]
    fn test_parse_sbatch_output_missing_id() {
        assert!(parse_sbatch_output("").is_err());
        assert!(parse_sbatch_output("sbatch: error: invalid partition").is_err());
    }

    #[test]
    fn test_first_host_plain() {
        assert_eq!(first_host("mel2001"), Some("mel2001".to_string()));
        assert_eq!(first_host("mel2001,mel2002"), Some("mel2001".to_string()));
    }

    #[test]
    fn test_first_host_ranges() {
        assert_eq!(first_host("mel[2001-2003]"), Some("mel2001".to_string()));
        assert_eq!(first_host("a[07,09-10],b1"), Some("a07".to_string()));
        assert_eq!(
            first_host("rack[1-2]-node[05-08]"),
            Some("rack1-node05".to_string())
        );
    }

    #[test]
    fn test_first_host_empty() {
        assert_eq!(first_host(""), None);
        assert_eq!(first_host("(null)"), None);
        assert_eq!(first_host("None assigned"), None);
    }

    #[test]
    fn test_parse_squeue_row() {
        let row = parse_job_table("812|llm_1|RUNNING|1:02:03|mel[2001-2002]\n", "812")
            .unwrap()
            .unwrap();
        assert_eq!(row.job_id, "812");
        assert_eq!(row.name, "llm_1");
        assert_eq!(row.state, "RUNNING");
        assert_eq!(row.elapsed, Some(Duration::from_secs(3723)));
        assert_eq!(row.node.as_deref(), Some("mel2001"));
    }

    #[test]
    fn test_parse_pending_row_without_node() {
        let row = parse_job_table("812|llm|PENDING|0:00|", "812")
            .unwrap()
            .unwrap();
        assert_eq!(row.state, "PENDING");
        assert_eq!(row.node, None);
    }

    #[test]
    fn test_parse_row_name_with_separator() {
        let row = parse_job_table("5|a|b|COMPLETED|00:10:00|n1", "5")
            .unwrap()
            .unwrap();
        assert_eq!(row.name, "a|b");
        assert_eq!(row.state, "COMPLETED");
    }

    #[test]
    fn test_parse_sacct_selects_requested_job() {
        let output = "811|other|COMPLETED|00:01:00|n1\n812|llm|CANCELLED by 1000|00:02:00|n2\n";
        let row = parse_job_table(output, "812").unwrap().unwrap();
        assert_eq!(row.state, "CANCELLED by 1000");
        assert_eq!(row.node.as_deref(), Some("n2"));
    }

    #[test]
    fn test_parse_table_without_requested_job() {
        let output = "811|other|RUNNING|00:01:00|n1\n813|next|PENDING|0:00|\n";
        assert_eq!(parse_job_table(output, "812").unwrap(), None);
    }

    #[test]
    fn test_parse_job_list() {
        let output = "\
4242|llm_a1b2c30001|RUNNING|12:01|mel[2001-2002]
4243|bench_a1b2c30003|PENDING|0:00|
4250|interactive|RUNNING|1-02:00:00|mel0007
";
        let rows = parse_job_list(output).unwrap();
        let ids: Vec<_> = rows.iter().map(|row| row.job_id.as_str()).collect();
        assert_eq!(ids, vec!["4242", "4243", "4250"]);
        assert_eq!(rows[0].name, "llm_a1b2c30001");
        assert_eq!(rows[0].node.as_deref(), Some("mel2001"));
        assert_eq!(rows[1].state, "PENDING");
        assert_eq!(rows[1].node, None);
        assert_eq!(rows[2].elapsed, Some(Duration::from_secs(26 * 3600)));
        assert!(parse_job_list("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_empty_table() {
        assert_eq!(parse_job_table("\n", "1").unwrap(), None);
    }

    #[test]
    fn test_parse_garbage_table() {
        assert!(parse_job_table("slurm_load_jobs error: Invalid job id", "1").is_err());
    }
}

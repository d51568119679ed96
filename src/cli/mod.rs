//! Command-line interface
//!
//! Argument parsing plus the argument echo printed at startup.

pub mod args;

pub use args::Cli;

use tracing::info;

/// Name/value pairs of every job argument, in flag order
pub fn summarize(cli: &Cli) -> Vec<(&'static str, String)> {
    let optional = |value: Option<String>| value.unwrap_or_else(|| "None".to_string());
    vec![
        ("rerun", cli.rerun.clone()),
        ("instrument", cli.instrument.clone()),
        ("program", cli.program.clone()),
        ("filter", cli.filter.clone()),
        ("dateObs", optional(cli.date_obs.clone())),
        ("workDirRoot", cli.work_dir_root.display().to_string()),
        (
            "destWcs",
            optional(cli.dest_wcs.as_ref().map(|p| p.display().to_string())),
        ),
        ("doMatchPsf", cli.do_match_psf.to_string()),
    ]
}

/// Log the job arguments once, before any collective runs
pub fn echo_arguments(cli: &Cli) {
    for (name, value) in summarize(cli) {
        info!("{} : {}", name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_summary_lists_every_job_argument() {
        let cli = Cli::parse_from([
            "stack-exposures",
            "-r",
            "cosmos",
            "-p",
            "COSMOS_0",
            "-f",
            "W-S-I+",
            "-m",
        ]);
        let summary = summarize(&cli);
        let names: Vec<&str> = summary.iter().map(|(n, _)| *n).collect();
        assert_eq!(
            names,
            vec![
                "rerun",
                "instrument",
                "program",
                "filter",
                "dateObs",
                "workDirRoot",
                "destWcs",
                "doMatchPsf"
            ]
        );
        assert_eq!(summary[4].1, "None");
        assert_eq!(summary[7].1, "true");
    }
}

// Command line utility for running dataset analyses

use anyhow::{Context, Error};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::{info, LevelFilter};
use sc_analysis::pipeline::PROGRESS_FILE;
use sc_analysis::summary::write_preprocess;
use sc_analysis::{
    dataset_status, delete_results, kind, run_full_analysis, run_post_analysis, Analysis, AnalysisError, Criterion,
    DiffexpMode, MemoCache, PipelineOutcome, ReclusterOp,
};
use sc_types::TrackValues;
use serde_json::json;
use snoop::FileSnoop;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

fn dir_arg() -> Arg {
    Arg::new("DIR")
        .help("Dataset directory")
        .required(true)
        .index(1)
        .value_parser(value_parser!(PathBuf))
}

fn cli() -> Command {
    Command::new("sca-cmd")
        .about("Cached single-cell analysis of dataset directories")
        .subcommand_required(true)
        .arg(
            Arg::new("VERBOSE")
                .help("Log debug messages")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new("summarize")
                .about("Summarize the raw data and write preprocess.json")
                .arg(dir_arg()),
        )
        .subcommand(
            Command::new("run")
                .about("Compute every artifact of a dataset")
                .arg(dir_arg())
                .arg(
                    Arg::new("POST")
                        .help("Only recompute what depends on the clustering")
                        .long("post")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(Command::new("status").about("Report the state of a dataset").arg(dir_arg()))
        .subcommand(
            Command::new("delete")
                .about("Remove every derived file of a dataset")
                .arg(dir_arg()),
        )
        .subcommand(
            Command::new("recluster")
                .about("Split, merge, create or delete clusters")
                .arg(dir_arg())
                .arg(
                    Arg::new("OP")
                        .required(true)
                        .index(2)
                        .value_parser(["split", "merge", "new", "delete"]),
                )
                .arg(
                    Arg::new("IDS")
                        .help("Comma separated cluster ids or cell indices")
                        .required(true)
                        .index(3),
                ),
        )
        .subcommand(
            Command::new("diffexp")
                .about("Differential expression over a discrete color track")
                .arg(dir_arg())
                .arg(Arg::new("TRACK").required(true).index(2))
                .arg(
                    Arg::new("MODE")
                        .long("mode")
                        .default_value("1_vs_rest")
                        .value_parser(["1_vs_rest", "pairwise"]),
                ),
        )
        .subcommand(
            Command::new("add-track")
                .about("Upload a color track, one value per line")
                .arg(dir_arg())
                .arg(Arg::new("NAME").required(true).index(2))
                .arg(
                    Arg::new("FILE")
                        .required(true)
                        .index(3)
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("CONTINUOUS")
                        .help("Values are numbers rather than labels")
                        .long("continuous")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("label")
                .about("Set the criteria of one label of a custom selection")
                .arg(dir_arg())
                .arg(Arg::new("SELECTION").required(true).index(2))
                .arg(Arg::new("LABEL").required(true).index(3))
                .arg(
                    Arg::new("CRITERIA")
                        .help("JSON list of criteria")
                        .required(true)
                        .index(4),
                )
                .arg(Arg::new("COLOR").long("color")),
        )
        .subcommand(
            Command::new("top-genes")
                .about("Top genes of each cluster, or of one")
                .arg(dir_arg())
                .arg(Arg::new("CLUSTER").long("cluster").value_parser(value_parser!(usize)))
                .arg(
                    Arg::new("NUM")
                        .short('n')
                        .default_value("10")
                        .value_parser(value_parser!(usize)),
                ),
        )
}

fn dir(matches: &ArgMatches) -> Result<&Path, Error> {
    matches
        .get_one::<PathBuf>("DIR")
        .map(PathBuf::as_path)
        .context("missing dataset directory")
}

fn arg<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a str, Error> {
    matches
        .get_one::<String>(name)
        .map(String::as_str)
        .with_context(|| format!("missing {name}"))
}

fn parse_ids(ids: &str) -> Result<Vec<usize>, Error> {
    ids.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>().with_context(|| format!("bad id {s:?}")))
        .collect()
}

fn read_track(path: &Path, continuous: bool) -> Result<TrackValues, Error> {
    let text = fs::read_to_string(path).with_context(|| path.display().to_string())?;
    let lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    Ok(if continuous {
        TrackValues::Continuous(
            lines
                .map(|l| l.parse::<f64>().with_context(|| format!("bad value {l:?}")))
                .collect::<Result<_, _>>()?,
        )
    } else {
        TrackValues::Discrete(lines.map(str::to_string).collect())
    })
}

fn outcome_json(outcome: &PipelineOutcome) -> serde_json::Value {
    match outcome {
        PipelineOutcome::Completed(record) => json!({ "status": "completed", "record": record }),
        PipelineOutcome::Failed(trace) => json!({ "status": "failed", "error": trace }),
    }
}

fn run(matches: &ArgMatches) -> Result<serde_json::Value, Error> {
    let memo = Arc::new(MemoCache::default());
    let (name, sub) = matches.subcommand().context("missing subcommand")?;
    let dir = dir(sub)?;

    let value = match name {
        "summarize" => serde_json::to_value(write_preprocess(dir)?)?,
        "status" => serde_json::to_value(dataset_status(dir)?)?,
        "delete" => json!({ "removed": delete_results(dir)? }),
        "run" => {
            let mut analysis = Analysis::open(dir, memo)?;
            let snoop = FileSnoop::new(dir.join(PROGRESS_FILE));
            let outcome = if sub.get_flag("POST") {
                run_post_analysis(&mut analysis, snoop)?
            } else {
                run_full_analysis(&mut analysis, snoop)?
            };
            outcome_json(&outcome)
        }
        "recluster" => {
            let op = ReclusterOp::parse(arg(sub, "OP")?, parse_ids(arg(sub, "IDS")?)?)?;
            let mut analysis = Analysis::open(dir, memo)?;
            analysis.recluster(op.clone())?;
            let outcome = run_post_analysis(&mut analysis, FileSnoop::new(dir.join(PROGRESS_FILE)))?;
            json!({
                "op": op,
                "clusters": analysis.n_clusters()?,
                "post_analysis": outcome_json(&outcome),
            })
        }
        "diffexp" => {
            let mode: DiffexpMode = arg(sub, "MODE")?.parse()?;
            let mut analysis = Analysis::open(dir, memo)?;
            let result = analysis.calculate_diffexp(arg(sub, "TRACK")?, mode)?;
            serde_json::to_value(result.as_ref())?
        }
        "add-track" => {
            let name = arg(sub, "NAME")?;
            let path = sub.get_one::<PathBuf>("FILE").context("missing FILE")?;
            let values = read_track(path, sub.get_flag("CONTINUOUS"))?;
            let mut analysis = Analysis::open(dir, memo)?;
            analysis.add_color_track(name, values)?;
            serde_json::to_value(analysis.color_track_names()?)?
        }
        "label" => {
            let criteria: Vec<Criterion> =
                serde_json::from_str(arg(sub, "CRITERIA")?).context("parsing criteria")?;
            let selection = arg(sub, "SELECTION")?;
            let color = sub.get_one::<String>("COLOR").cloned();
            let mut analysis = Analysis::open(dir, memo)?;
            analysis.update_label_criteria(selection, arg(sub, "LABEL")?, criteria, color)?;
            let track = analysis.color_track(selection)?;
            json!({
                "selection": analysis.custom_selection(selection)?,
                "track": track.as_deref(),
            })
        }
        "top-genes" => {
            let n = sub.get_one::<usize>("NUM").copied().unwrap_or(10);
            let mut analysis = Analysis::open(dir, memo)?;
            match sub.get_one::<usize>("CLUSTER") {
                Some(&c) => serde_json::to_value(analysis.cluster_top_genes(c, n)?.as_ref())?,
                None => {
                    let mut all = BTreeMap::new();
                    for c in 0..analysis.n_clusters()? {
                        all.insert(c.to_string(), analysis.cluster_top_genes(c, n)?.as_ref().clone());
                    }
                    serde_json::to_value(all)?
                }
            }
        }
        other => anyhow::bail!("unknown subcommand {other}"),
    };
    info!("{} finished for {}", name, dir.display());
    Ok(value)
}

pub fn main() -> ExitCode {
    let matches = cli().get_matches();
    let level = if matches.get_flag("VERBOSE") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    match run(&matches) {
        Ok(value) => {
            println!("{value:#}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            if let Some(AnalysisError::LockHeld { .. }) = kind(&err) {
                eprintln!("computation already in progress, try again");
            } else {
                eprintln!("error: {err:#}");
            }
            ExitCode::FAILURE
        }
    }
}

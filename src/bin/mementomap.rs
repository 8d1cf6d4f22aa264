use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::PathBuf,
};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use flate2::read::MultiGzDecoder;
use log::{debug, info};

use mementomap::{
    compact::{compact, generate},
    config::{Config, LayerOverrides},
    fs::FileSink,
    lookup::Summary,
};

#[derive(Parser)]
#[command(author, version, about = "Build, compact and query MementoMap summaries")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a MementoMap from a sorted file whose first column is a SURT
    /// (CDX, CDXJ). Rollups are off unless compaction factors are given.
    Generate {
        /// Input file, plain or gzipped, or '-' for stdin
        infile: String,
        outfile: PathBuf,
        #[command(flatten)]
        tunables: Tunables,
    },
    /// Compact a MementoMap into a smaller one
    Compact {
        /// Input file, plain or gzipped, or '-' for stdin
        infile: String,
        outfile: PathBuf,
        #[command(flatten)]
        tunables: Tunables,
    },
    /// Look up one SURT in a MementoMap
    Lookup { mmap: PathBuf, surt: String },
    /// Look up one SURT per input line in a MementoMap
    Batchlookup {
        mmap: PathBuf,
        /// Input file, plain or gzipped, or '-' for stdin
        infile: String,
    },
}

#[derive(Args, Debug)]
struct Tunables {
    /// JSON file with "host" and/or "path" layer settings
    #[arg(long)]
    config: Option<PathBuf>,
    /// Host compaction factor
    #[arg(long)]
    hcf: Option<f64>,
    /// Path compaction factor
    #[arg(long)]
    pcf: Option<f64>,
    /// Power law alpha for hosts (default 16.329)
    #[arg(long)]
    ha: Option<f64>,
    /// Power law k for hosts (default 0.714)
    #[arg(long)]
    hk: Option<f64>,
    /// Power law alpha for paths (default 24.546)
    #[arg(long)]
    pa: Option<f64>,
    /// Power law k for paths (default 1.429)
    #[arg(long)]
    pk: Option<f64>,
    /// Max host depth (default 8)
    #[arg(long)]
    hdepth: Option<usize>,
    /// Max path depth (default 9)
    #[arg(long)]
    pdepth: Option<usize>,
}

impl Tunables {
    // Flags win over the config file, which wins over `base`.
    fn resolve(&self, base: Config) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => base.load(path)?,
            None => base,
        };
        LayerOverrides {
            alpha: self.ha,
            k: self.hk,
            compaction_factor: self.hcf,
            max_depth: self.hdepth,
        }
        .apply(&mut config.host);
        LayerOverrides {
            alpha: self.pa,
            k: self.pk,
            compaction_factor: self.pcf,
            max_depth: self.pdepth,
        }
        .apply(&mut config.path);
        config.validate()?;
        debug!("using {}", serde_json::to_string(&config)?);
        Ok(config)
    }
}

fn open_input(infile: &str) -> anyhow::Result<Box<dyn BufRead>> {
    if infile == "-" {
        return Ok(Box::new(BufReader::new(io::stdin())));
    }
    let file = File::open(infile).with_context(|| format!("opening {}", infile))?;
    if infile.ends_with(".gz") {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    match Cli::parse().command {
        Command::Generate {
            infile,
            outfile,
            tunables,
        } => {
            let config = tunables.resolve(Config::uncompacted())?;
            info!("generating {} from {}", outfile.display(), infile);
            let stats = generate(open_input(&infile)?, FileSink::create(&outfile)?, &config)?;
            debug!("{}", serde_json::to_string(&stats)?);
            println!("{}", stats);
        }
        Command::Compact {
            infile,
            outfile,
            tunables,
        } => {
            let config = tunables.resolve(Config::default())?;
            info!("compacting {} into {}", infile, outfile.display());
            let stats = compact(open_input(&infile)?, FileSink::create(&outfile)?, &config)?;
            debug!("{}", serde_json::to_string(&stats)?);
            println!("{}", stats);
        }
        Command::Lookup { mmap, surt } => {
            let mut summary = Summary::open(&mmap)?;
            if let Some(hit) = summary.lookup(surt.as_bytes())? {
                hit.write_line(&mut io::stdout().lock(), surt.as_bytes())?;
            }
        }
        Command::Batchlookup { mmap, infile } => {
            let mut summary = Summary::open(&mmap)?;
            let stats = summary.batch_lookup(open_input(&infile)?, io::stdout().lock())?;
            info!("{} of {} queries matched", stats.hits, stats.queries);
        }
    }
    Ok(())
}

pub mod config;
pub mod validate;

use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

use crate::error::ConfigError;
use config::{parse_stage_arg, Config};

#[derive(Parser)]
#[command(name = "barrage")]
#[command(about = "Staged HTTP load generator with pass/fail thresholds", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a load test scenario
    Run(RunArgs),
    /// Validate a scenario file without generating load
    Validate {
        /// Path to the scenario file (YAML/JSON)
        scenario: PathBuf,
    },
    /// Print the JSON Schema of the scenario file format
    Schema {
        /// Write the schema to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Generate shell completions
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Path to the scenario file (YAML/JSON). Optional when --url and --stage are given
    pub scenario: Option<PathBuf>,

    /// Replace the scenario's stages (repeatable, e.g. --stage 30s:100)
    #[arg(short, long = "stage", value_name = "DURATION:TARGET")]
    pub stages: Vec<String>,

    /// Override the request url
    #[arg(short, long)]
    pub url: Option<String>,

    /// Override the per-request timeout (e.g. 10s)
    #[arg(long)]
    pub timeout: Option<String>,

    /// Override the pause between iterations (e.g. 500ms)
    #[arg(long, alias = "sleep")]
    pub pause: Option<String>,

    /// Override the control loop tick (e.g. 100ms)
    #[arg(long)]
    pub tick: Option<String>,

    /// Override how long retiring VUs may take to finish (e.g. 30s)
    #[arg(long)]
    pub graceful_stop: Option<String>,

    /// Print the final summary as JSON instead of the console report
    #[arg(long)]
    pub json: bool,

    /// Export the final summary to a JSON file
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    /// Read pause, resume, status and stop commands from stdin
    #[arg(long, short = 'i')]
    pub interactive: bool,

    /// Disable the pre-flight memory capacity check
    #[arg(long)]
    pub no_memory_check: bool,

    /// Only log warnings and errors
    #[arg(long, short = 'q')]
    pub quiet: bool,
}

impl RunArgs {
    /// Load the scenario (if any) and layer the command line on top.
    pub fn load_config(&self) -> Result<Config, ConfigError> {
        let mut config = match &self.scenario {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        self.apply_overrides(&mut config)?;
        Ok(config)
    }

    pub fn apply_overrides(&self, config: &mut Config) -> Result<(), ConfigError> {
        if !self.stages.is_empty() {
            let steps = self
                .stages
                .iter()
                .map(|s| parse_stage_arg(s))
                .collect::<Result<Vec<_>, _>>()?;
            config.stages = Some(steps);
        }
        if let Some(url) = &self.url {
            config.request.get_or_insert_with(Default::default).url = Some(url.clone());
        }
        if let Some(t) = &self.timeout {
            config.timeout = Some(t.clone());
        }
        if let Some(p) = &self.pause {
            config.pause = Some(p.clone());
        }
        if let Some(t) = &self.tick {
            config.tick = Some(t.clone());
        }
        if let Some(g) = &self.graceful_stop {
            config.graceful_stop = Some(g.clone());
        }
        Ok(())
    }
}

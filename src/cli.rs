//! 命令行参数定义

use crate::config::{SyncOptions, SyncSettings};
use crate::core::{SlotId, DESTINATION_SLOTS};
use crate::error::{Result, SyncError};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};

/// Multi-destination rsync/cp sync for camera media offloads
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration directory (defaults to the platform config dir)
    #[arg(long, global = true, value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Sync one or both slots until every destination finishes
    Run(SlotArgs),

    /// Print a sample settings file, or write it with --output
    Template {
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Write the effective settings to FILE (a `_sync` suffix is added)
    SaveSettings {
        #[command(flatten)]
        slot: SlotArgs,

        #[arg(value_name = "FILE")]
        output: PathBuf,

        /// Also store the options as defaults in config.json
        #[arg(long)]
        remember: bool,
    },

    /// Show or change diagnostic logging
    LogConfig {
        #[arg(long)]
        enabled: Option<bool>,

        /// Maximum log file size in MB (1-100)
        #[arg(long)]
        max_size_mb: Option<u32>,

        /// error, warn, info, debug or trace
        #[arg(long)]
        level: Option<String>,
    },
}

/// Which sync slots to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum SlotSelection {
    #[default]
    #[value(name = "1")]
    One,
    #[value(name = "2")]
    Two,
    Both,
}

impl SlotSelection {
    pub fn slots(self) -> Vec<SlotId> {
        match self {
            SlotSelection::One => vec![SlotId::One],
            SlotSelection::Two => vec![SlotId::Two],
            SlotSelection::Both => SlotId::ALL.to_vec(),
        }
    }
}

/// Source/destination selection plus option overrides
#[derive(Args, Debug, Clone, Default)]
pub struct SlotArgs {
    /// Settings file exported by `save-settings` or `template`
    #[arg(short, long, value_name = "FILE")]
    pub settings: Option<PathBuf>,

    /// Slot to run
    #[arg(long, value_enum, default_value_t = SlotSelection::One)]
    pub slot: SlotSelection,

    /// Source directory (overrides the settings file for the first selected slot)
    #[arg(long, value_name = "DIR")]
    pub source: Option<String>,

    /// Destination directory, up to four (repeat the flag)
    #[arg(short = 'd', long = "dest", value_name = "DIR")]
    pub destinations: Vec<String>,

    #[command(flatten)]
    pub overrides: OptionOverrides,
}

#[derive(Args, Debug, Clone, Default)]
pub struct OptionOverrides {
    /// Run destinations one after another
    #[arg(long, conflicts_with = "simultaneous")]
    pub sequential: bool,

    /// Run all destinations at the same time
    #[arg(long)]
    pub simultaneous: bool,

    /// Disable fast mode (keep rsync's default comparison)
    #[arg(long)]
    pub no_fast: bool,

    /// Verify with checksums (xxh64 on rsync 3.2.0+)
    #[arg(long)]
    pub checksum: bool,

    /// Use `cp -R` instead of rsync
    #[arg(long)]
    pub native_cp: bool,

    /// Do not try to raise process priority
    #[arg(long)]
    pub no_priority: bool,

    /// Write a global transfer log into DIR
    #[arg(long, value_name = "DIR")]
    pub global_log: Option<String>,

    /// Write rsync_log.txt into every destination
    #[arg(long)]
    pub dest_log: bool,
}

impl OptionOverrides {
    pub fn apply(&self, options: &mut SyncOptions) {
        if self.sequential {
            options.simultaneous_sync = false;
        }
        if self.simultaneous {
            options.simultaneous_sync = true;
        }
        if self.no_fast {
            options.fast_sync = false;
        }
        if self.checksum {
            options.checksum_verification = true;
        }
        if self.native_cp {
            options.native_copy = true;
        }
        if self.no_priority {
            options.higher_priority = false;
        }
        if let Some(dir) = &self.global_log {
            options.global_logging_enabled = true;
            options.global_log_dir = dir.clone();
        }
        if self.dest_log {
            options.destination_logging_enabled = true;
        }
    }
}

impl SlotArgs {
    /// 合并设置文件、config.json 默认值和命令行参数
    pub fn resolve(&self, config_dir: &Path) -> Result<(SyncSettings, Vec<SlotId>)> {
        let mut settings = match &self.settings {
            Some(path) => SyncSettings::import(path)?,
            None => SyncSettings {
                options: SyncOptions::load(config_dir),
                ..SyncSettings::default()
            },
        };
        self.overrides.apply(&mut settings.options);

        if self.destinations.len() > DESTINATION_SLOTS {
            return Err(SyncError::Settings(format!(
                "At most {} destination directories are supported.",
                DESTINATION_SLOTS
            )));
        }

        let slots = self.slot.slots();
        if self.source.is_some() || !self.destinations.is_empty() {
            let slot = slots[0];
            let (current_source, current_dests) = settings.slot(slot);
            let source = self
                .source
                .clone()
                .unwrap_or_else(|| current_source.to_string());
            let destinations = if self.destinations.is_empty() {
                current_dests.to_vec()
            } else {
                self.destinations.clone()
            };
            settings.set_slot(slot, source, destinations);
        }

        Ok((settings, slots))
    }
}

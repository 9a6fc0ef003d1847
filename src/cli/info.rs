use anyhow::Result;
use clap::Parser;
use serde::Serialize;
use tokio::task::block_in_place;

use crate::Dataset;
use crate::cli::SubCommandExtend;
use crate::config::{DatasetOptions, OutputFormat, Opts};

#[derive(Parser, Debug, Clone)]
pub struct InfoCommand {
    #[command(flatten)]
    pub dataset: DatasetOptions,
    /// 输出格式
    #[arg(long, value_enum, value_name = "FORMAT", default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

#[derive(Debug, Serialize)]
struct DatasetInfo {
    variant: String,
    root: String,
    references: usize,
    queries: usize,
    total: usize,
    ground_truth_entries: usize,
    mean_matches: f64,
}

impl SubCommandExtend for InfoCommand {
    async fn run(&self, _opts: &Opts) -> Result<()> {
        let dataset = block_in_place(|| self.dataset.open())?;
        let gt = dataset.ground_truth();

        let info = DatasetInfo {
            variant: self.dataset.variant.clone(),
            root: dataset.root().display().to_string(),
            references: dataset.num_references(),
            queries: dataset.num_queries(),
            total: dataset.len(),
            ground_truth_entries: gt.len(),
            mean_matches: if gt.is_empty() {
                0.
            } else {
                gt.total_matches() as f64 / gt.len() as f64
            },
        };

        match self.output_format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&info)?),
            OutputFormat::Table => {
                println!("variant\t{}", info.variant);
                println!("root\t{}", info.root);
                println!("references\t{}", info.references);
                println!("queries\t{}", info.queries);
                println!("total\t{}", info.total);
                println!("ground_truth\t{}", info.ground_truth_entries);
                println!("mean_matches\t{:.2}", info.mean_matches);
            }
        }
        Ok(())
    }
}

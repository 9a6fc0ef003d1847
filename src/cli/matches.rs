use anyhow::{Result, anyhow};
use clap::Parser;
use tokio::task::block_in_place;

use crate::cli::SubCommandExtend;
use crate::config::{DatasetOptions, Opts};

#[derive(Parser, Debug, Clone)]
pub struct MatchesCommand {
    #[command(flatten)]
    pub dataset: DatasetOptions,
    /// 查询图片在查询列表中的下标
    pub query: usize,
}

impl SubCommandExtend for MatchesCommand {
    async fn run(&self, _opts: &Opts) -> Result<()> {
        let dataset = block_in_place(|| self.dataset.open())?;

        let name = dataset.queries().get(self.query).ok_or_else(|| {
            anyhow!("查询下标 {} 超出范围，共 {} 张查询图片", self.query, dataset.num_queries())
        })?;
        let matches = dataset.ground_truth().matches(self.query).unwrap_or_default();

        println!("{}", name);
        let references = dataset.references();
        for &reference in matches {
            println!("{}\t{}", reference, references[reference as usize]);
        }
        Ok(())
    }
}

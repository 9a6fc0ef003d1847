mod check;
mod info;
mod matches;
mod show;

pub use check::*;
pub use info::*;
pub use matches::*;
pub use show::*;

use crate::config::Opts;

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}

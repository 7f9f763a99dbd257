use std::fmt;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use dns_audit::jobs::Collected;
use dns_audit::DomainTask;

use crate::metrics;

/// Totals over every audited domain.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct LameStats {
    pub total: u64,
    pub lame: u64,
    pub problems: u64,
    pub failed: u64,
}

impl LameStats {
    pub fn add(&mut self, task: &DomainTask) {
        self.total += 1;
        if task.lame {
            self.lame += 1;
        }
        if task.is_failed() {
            self.failed += 1;
        }
        self.problems += task.problems;
    }
}

impl fmt::Display for LameStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "STATS: {}/{} lame delegations and {} problems, {} domains could not be resolved",
            self.lame, self.total, self.problems, self.failed
        )
    }
}

/// The collector: write a line for every finding of every audited
/// domain as it arrives, and then the totals.
pub async fn report<W: AsyncWrite + Unpin>(
    mut collected: Collected<DomainTask>,
    out: &mut W,
) -> std::io::Result<LameStats> {
    let mut stats = LameStats::default();

    while let Some(task) = collected.recv().await {
        tracing::debug!(
            domain = %task.name,
            lame = %task.lame,
            problems = %task.problems,
            "audited"
        );
        for step in &task.trail {
            tracing::debug!(
                domain = %task.name,
                zone = %step.zone,
                servers = ?step.servers,
                computed = %step.computed,
                "trail"
            );
        }

        for finding in &task.findings {
            out.write_all(format!("[FINDING] {finding}\n").as_bytes())
                .await?;
        }

        stats.add(&task);
        metrics::record_task(&task);
    }

    out.write_all(format!("{stats}\n").as_bytes()).await?;
    out.flush().await?;

    Ok(stats)
}

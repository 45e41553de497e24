use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use serde_json::json;

use sr_core::types::VcsMode;
use sr_vcs::backend::{backend_for_mode, install_hint, tool_for_mode};
use sr_vcs::process::{CommandRunner, TokioCommandRunner};

const MODES: [VcsMode; 4] = [
    VcsMode::MergeCommit,
    VcsMode::GitSpice,
    VcsMode::Graphite,
    VcsMode::Sapling,
];

pub async fn run(strict: bool, json: bool) -> anyhow::Result<()> {
    let runner: Arc<dyn CommandRunner> = Arc::new(TokioCommandRunner);
    let timeout = Duration::from_secs(10);

    let mut checks = Vec::new();
    for mode in MODES {
        let backend = backend_for_mode(mode, runner.clone(), timeout);
        let available = backend.is_available().await;
        checks.push((mode, available));
    }

    let missing = checks.iter().filter(|(_, ok)| !ok).count();

    if json {
        let entries: Vec<_> = checks
            .iter()
            .map(|(mode, ok)| {
                json!({
                    "mode": mode.to_string(),
                    "tool": tool_for_mode(*mode),
                    "available": ok,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for (mode, ok) in &checks {
            if *ok {
                println!("  ok       {:<14} ({})", mode.to_string(), tool_for_mode(*mode));
            } else {
                println!("  missing  {:<14} ({})", mode.to_string(), tool_for_mode(*mode));
                println!("           {}", install_hint(*mode));
            }
        }
    }

    if strict && missing > 0 {
        bail!("{missing} backend(s) unavailable");
    }
    Ok(())
}

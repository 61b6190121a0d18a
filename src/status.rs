use anyhow::Result;

use crawld_queue::QueueStore;

/// Prints queue counts by status and priority, then exits without crawling.
pub async fn print(queue: &QueueStore) -> Result<()> {
    queue.check_connectivity().await?;
    let stats = queue.stats().await?;

    println!("\n╔══════════════════════════════════════════════╗");
    println!("║              crawld queue status             ║");
    println!("╠══════════════════════════════════════════════╣");
    for status in ["pending", "in_flight", "visited", "failed", "excluded"] {
        let count = stats.by_status.get(status).copied().unwrap_or(0);
        println!("║ {:<18} {:>20}    ║", status, count);
    }
    println!("╠══════════════════════════════════════════════╣");
    let mut priorities: Vec<_> = stats.by_priority.iter().collect();
    priorities.sort_by_key(|(priority, _)| -**priority);
    for (priority, count) in priorities {
        println!("║ priority {:<8} {:>20}    ║", priority, count);
    }
    println!("╚══════════════════════════════════════════════╝\n");

    Ok(())
}

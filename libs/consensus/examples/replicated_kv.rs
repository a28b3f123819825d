//! Replicated key-value map on a three-member cluster
//!
//! This example starts three members on an in-process network, writes through
//! a follower, fails the leader and keeps writing on the remaining majority.
//!
//! Run with: cargo run --example replicated_kv

use anyhow::Context;
use raftstack_consensus::{LocalNetwork, NodeId, RaftConfig, ReplicatedStateMachine};
use std::time::Duration;

const MEMBERS: [&str; 3] = ["A", "B", "C"];

type Map = ReplicatedStateMachine<String, String>;

async fn wait_for_leader(maps: &[(&str, Map)], skip: Option<&NodeId>) -> anyhow::Result<NodeId> {
    for _ in 0..100 {
        let leader = maps
            .iter()
            .filter(|(name, _)| skip.map(|s| s.as_str() != *name).unwrap_or(true))
            .find(|(_, map)| map.is_leader())
            .and_then(|(_, map)| map.leader());
        if let Some(leader) = leader {
            return Ok(leader);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    anyhow::bail!("no leader elected")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("=== raftstack replicated map demo ===\n");

    let network = LocalNetwork::new();
    let mut maps = Vec::new();
    for name in MEMBERS {
        let config = RaftConfig::builder()
            .members(MEMBERS)
            .raft_id(name)
            .election_interval(Duration::from_millis(150), Duration::from_millis(300))
            .heartbeat_interval(Duration::from_millis(50))
            .build()?;
        let (transport, inbox) = network.join(name);
        let map = Map::start(config, transport, inbox)
            .with_context(|| format!("starting member {}", name))?;
        map.set_timeout(Duration::from_secs(2));
        println!("  ✓ Member {} started", name);
        maps.push((name, map));
    }

    println!("\nWaiting for leader election...");
    let leader = wait_for_leader(&maps, None).await?;
    println!("  ✓ Leader is {}\n", leader);

    // Writes through any member are routed to the leader
    let (follower, via) = maps
        .iter()
        .find(|(name, _)| *name != leader.as_str())
        .context("cluster has no follower")?;
    println!("Writing through follower {}", follower);
    via.put("username".to_string(), "alice".to_string()).await?;
    via.put("email".to_string(), "alice@example.com".to_string()).await?;
    let previous = via.put("username".to_string(), "bob".to_string()).await?;
    println!("  ✓ username replaced (was {:?})\n", previous);

    tokio::time::sleep(Duration::from_millis(200)).await;
    for (name, map) in &maps {
        println!(
            "  [{}] username = {:?}, email = {:?}",
            name,
            map.get(&"username".to_string()),
            map.get(&"email".to_string())
        );
    }

    println!("\nIsolating leader {}...", leader);
    network.isolate(&leader);
    let new_leader = wait_for_leader(&maps, Some(&leader)).await?;
    println!("  ✓ New leader is {}", new_leader);

    let (_, map) = maps
        .iter()
        .find(|(name, _)| *name == new_leader.as_str())
        .context("new leader is not a member")?;
    map.remove("email".to_string()).await?;
    println!("  ✓ email removed on the majority side");

    network.heal();
    tokio::time::sleep(Duration::from_millis(500)).await;
    println!("\nAfter healing:");
    for (name, map) in &maps {
        let status = map.node().status();
        println!(
            "  [{}] role = {}, term = {}, commit = {}, email = {:?}",
            name,
            status.role,
            status.term,
            status.commit_index,
            map.get(&"email".to_string())
        );
    }

    for (_, map) in &maps {
        map.node().shutdown().await;
    }
    println!("\n=== Demo complete ===");
    Ok(())
}

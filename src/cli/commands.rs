use anyhow::Result;
use futures::FutureExt;
use std::time::Instant;

use crate::cluster::{Item, MemcacheClient};
use crate::core::Core;
use crate::pool::Connection;
use crate::transport::WorkError;

/// Print the cluster topology
pub async fn cmd_endpoints(core: &Core) -> Result<()> {
    let endpoints = core.endpoints().await?;

    if endpoints.is_empty() {
        println!("No endpoints discovered");
        return Ok(());
    }

    for endpoint in &endpoints {
        println!("{}", endpoint);
    }
    println!("\nTotal: {} endpoint(s)", endpoints.len());

    Ok(())
}

/// Print pool health and counters
pub async fn cmd_stats(core: &Core, json: bool) -> Result<()> {
    let stats = core.stats().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Requests: {}", stats.requests);
    println!("Discoveries: {}", stats.sniffs);
    println!("Selector: {:?}", stats.pool.selector);
    println!(
        "Connections: {} total, {} alive, {} dead",
        stats.pool.total, stats.pool.alive, stats.pool.dead
    );

    for conn in &stats.pool.connections {
        let state = match conn.dead_for {
            Some(dead_for) => format!("dead for {:.1}s", dead_for.as_secs_f64()),
            None => "alive".to_string(),
        };
        println!("  {:<40} failures={:<3} {}", conn.endpoint, conn.failures, state);
    }

    Ok(())
}

/// Send `count` liveness requests and print who answered
pub async fn cmd_ping(core: &Core, count: usize) -> Result<()> {
    for seq in 1..=count.max(1) {
        let start = Instant::now();
        match core.ping().await {
            Ok((endpoint, answer)) => {
                println!(
                    "[{}] {} -> {} ({:.2}ms)",
                    seq,
                    endpoint,
                    answer,
                    start.elapsed().as_secs_f64() * 1000.0
                );
            }
            Err(e) => println!("[{}] error: {:#}", seq, e),
        }
    }

    Ok(())
}

/// Fetch one item
pub async fn cmd_get(core: &Core, key: &str) -> Result<()> {
    let get = core.memcache()?.bind(|conn: &mut Connection<MemcacheClient>, key: String| {
        async move { conn.client_mut().get(&key).await }.boxed()
    });

    match get.call(key.to_string()).await? {
        Some(item) => {
            println!("{}", String::from_utf8_lossy(&item.value));
            eprintln!("({} bytes, flags={})", item.value.len(), item.flags);
        }
        None => anyhow::bail!("Key not found: {}", key),
    }

    Ok(())
}

/// Store one item
pub async fn cmd_set(core: &Core, key: &str, value: &str, ttl: u32) -> Result<()> {
    let set = core.memcache()?.bind(|conn: &mut Connection<MemcacheClient>, item: Item| {
        async move { conn.client_mut().set(&item).await }.boxed()
    });

    let item = Item::new(key, value.to_string()).with_expiration(ttl);
    let size = item.value.len();
    set.call(item).await?;

    println!("Stored {} ({} bytes)", key, size);
    Ok(())
}

/// Delete one item
pub async fn cmd_delete(core: &Core, key: &str) -> Result<()> {
    let key = key.to_string();
    let deleted = core
        .memcache()?
        .request(move |conn: &mut Connection<MemcacheClient>| {
            let key = key.clone();
            async move { Ok::<_, WorkError>(conn.client_mut().delete(&key).await?) }.boxed()
        })
        .await?;

    if deleted {
        println!("Deleted");
    } else {
        println!("Key not found");
    }
    Ok(())
}

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use content_store_core::{ContentType, EntityKey, MirrorBackend};
use content_store_local::config::{Command, Config, MirrorKind};
use content_store_local::{ContentRegistry, NoopMirror};
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays pipeable JSON
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();

    let data_dir = config.effective_data_dir();
    let master_dir = config.effective_master_dir();
    info!("Starting content-store");
    info!("  Data dir: {}", data_dir.display());
    info!("  Master dir: {}", master_dir.display());
    info!("  Mirror: {}", config.mirror);

    let mirror = create_mirror(&config)?;
    let registry = ContentRegistry::new(&data_dir, &master_dir, mirror, config.store_options());
    registry.warm().await?;

    match config.command {
        Command::Warm => {
            let counts: serde_json::Map<String, serde_json::Value> = ContentType::ALL
                .iter()
                .map(|ct| {
                    (
                        ct.to_string(),
                        serde_json::Value::from(registry.get_all_from_cache(*ct).len()),
                    )
                })
                .collect();
            print_json(&counts)?;
        }
        Command::List { content_type } => {
            let entities: Vec<_> = registry
                .get_all_from_cache(content_type)
                .iter()
                .map(|entity| entity.to_value())
                .collect();
            print_json(&entities)?;
        }
        Command::Get { content_type, key } => {
            let key = EntityKey::parse(content_type, &key)?;
            match registry.load_by_id(content_type, &key).await? {
                Some(entity) => print_json(&entity.to_value())?,
                None => anyhow::bail!("{} {} not found", content_type, key),
            }
        }
        Command::Put { content_type, file } => {
            let document: serde_json::Value = serde_json::from_str(&read_input(&file).await?)?;
            let entity = registry.save(content_type, document).await?;
            info!("Saved {} {}", content_type, entity.key());
            print_json(&entity.to_value())?;
        }
        Command::Delete { content_type, key } => {
            let key = EntityKey::parse(content_type, &key)?;
            if !registry.delete(content_type, &key).await? {
                warn!("{} {} did not exist", content_type, key);
            }
        }
        Command::Sync {
            content_type: Some(content_type),
        } => {
            let report = registry.sync_from_master(content_type).await?;
            print_json(&report)?;
        }
        Command::Sync { content_type: None } => {
            let report = registry.sync_all_from_master().await;
            print_json(&report)?;
        }
        Command::Export { content_type } => {
            let path = registry.export_to_master(content_type).await?;
            info!("Exported {} to {}", content_type, path.display());
        }
        Command::NewPlayer {
            external_id,
            display_name,
        } => {
            let player = registry
                .get_new_player_defaults(&external_id, &display_name)
                .await?;
            print_json(&player)?;
        }
        Command::Defaults { content_type } => {
            print_json(&registry.get_defaults_by_type(content_type).await)?;
        }
    }

    Ok(())
}

fn create_mirror(config: &Config) -> anyhow::Result<Arc<dyn MirrorBackend>> {
    match config.mirror {
        MirrorKind::None => Ok(Arc::new(NoopMirror)),
        #[cfg(feature = "cloud")]
        MirrorKind::Kv => {
            let (Some(base_url), Some(token)) = (&config.kv_base_url, &config.kv_api_token) else {
                anyhow::bail!("KV_BASE_URL and KV_API_TOKEN are required for the kv mirror");
            };
            Ok(Arc::new(content_store_local::KvMirror::new(base_url.as_str(), token.as_str())))
        }
        #[cfg(not(feature = "cloud"))]
        MirrorKind::Kv => {
            anyhow::bail!("kv mirror is not available: rebuild with --features cloud");
        }
    }
}

async fn read_input(file: &Path) -> anyhow::Result<String> {
    if file == Path::new("-") {
        let mut buf = String::new();
        tokio::io::stdin().read_to_string(&mut buf).await?;
        Ok(buf)
    } else {
        Ok(tokio::fs::read_to_string(file).await?)
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use mbrace_common::tracing::init_tracing_with_default_env_filter;
use mbrace_runtime::assembly::InMemoryAssemblyManager;
use mbrace_runtime::cluster::{ClusterConfiguration, ClusterManager};
use mbrace_runtime::config::{make_config_loader, RuntimeConfig};
use mbrace_runtime::metrics;
use mbrace_runtime::scheduler::SchedulerFactoryDisabled;
use mbrace_runtime::storage::InMemoryArtifactStore;
use std::sync::Arc;
use tracing::info;

fn main() -> Result<(), std::io::Error> {
    if let Some(config) = make_config_loader().load_or_dump_config() {
        init_tracing_with_default_env_filter(&config.tracing);
        let _prometheus = metrics::register_all();

        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(async_main(config))
    } else {
        Ok(())
    }
}

async fn async_main(config: RuntimeConfig) -> Result<(), std::io::Error> {
    let cluster = Arc::new(ClusterManager::new(
        config.clone(),
        Arc::new(SchedulerFactoryDisabled),
        Arc::new(InMemoryAssemblyManager::new()),
        Arc::new(InMemoryArtifactStore::new()),
    ));

    cluster
        .master_boot(ClusterConfiguration {
            nodes: vec![],
            replication_factor: config.replication.replication_factor,
            failover_factor: config.replication.failover_factor,
        })
        .map_err(std::io::Error::other)?;

    info!(
        deployment_id = %cluster.deployment_id(),
        "MBrace master node started, waiting for nodes to attach"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    cluster.shutdown_sync().await;
    Ok(())
}

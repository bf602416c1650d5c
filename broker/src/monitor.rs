use std::time::Instant;
use tracing::{info, warn};

use crate::state::AppState;

/// Barrido periódico de liveness: marca muertos a los agentes sin heartbeat
/// y desaloja los que siguen sin contacto pasado el múltiplo de desalojo.
pub async fn monitor_agents(state: AppState) {
    let interval = state.config.heartbeat_interval;
    let (dead_after, evict_after) = (state.config.dead_after(), state.config.evict_after());
    info!(
        "monitor de agentes: muerto tras {:?}, desalojo tras {:?}",
        dead_after, evict_after
    );

    loop {
        tokio::time::sleep(interval).await;

        let outcome = state
            .registry
            .sweep(Instant::now(), dead_after, evict_after);
        for id in &outcome.newly_dead {
            warn!("marcando agente {} como DEAD (sin heartbeat hace más de {:?})", id, dead_after);
        }
        for id in &outcome.evicted {
            warn!("desalojando agente {}", id);
        }
    }
}

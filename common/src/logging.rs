use tracing_subscriber::EnvFilter;

fn filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Inicializa el subscriber global. `RUST_LOG` tiene prioridad sobre el filtro por defecto.
/// Llamarlo dos veces no falla (útil en tests).
pub fn init_tracing(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(default_filter))
        .try_init();
}

/// Igual que `init_tracing` pero escribe en stderr; stdout queda libre para
/// el reporte final del executor.
pub fn init_tracing_stderr(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(default_filter))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

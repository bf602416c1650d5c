use agent::executor::{emit, run, ExecutorEnv};
use common::{logging::init_tracing_stderr, StepRegistry};

#[tokio::main]
async fn main() {
    init_tracing_stderr("flow_executor=info,agent=info,common=info");

    let result = match ExecutorEnv::from_env() {
        Ok(env) => run(env, StepRegistry::with_builtins()).await,
        Err(e) => Err(e),
    };
    std::process::exit(emit(&result));
}

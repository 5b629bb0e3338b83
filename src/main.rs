use lsmkv::{Engine, EngineConfig};
use serde_json::json;

fn main() -> lsmkv::Result<()> {
    tracing_subscriber::fmt::init();

    let config = EngineConfig::builder()
        .dir_path("/var/lib/lsmkv/data")
        .build()?;

    let engine = Engine::open(config)?;
    engine.put("demo", "hello", json!({"greeting": "world"}))?;
    let value = engine.get("demo", "hello")?;
    println!("demo:hello = {value:?}");
    engine.close()?;
    Ok(())
}

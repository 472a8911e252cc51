use std::net::SocketAddr;

use anyhow::Context as _;
use stagehand::config::Config;
use stagehand::embed::EmbeddedEngine;
use stagehand::error::HandlerError;
use stagehand::http::{Request, Response};
use stagehand::servlet::{Handler, HandlerConfig, HandlerWrapper};
use tracing_subscriber::EnvFilter;
use url::Url;

/// Answers every request with a greeting.
#[derive(Default)]
struct Hello {
    greeting: parking_lot::RwLock<String>,
}

impl Handler for Hello {
    fn init(&self, config: &HandlerConfig) -> Result<(), HandlerError> {
        let greeting = config.init_param("greeting").unwrap_or("Hello");
        *self.greeting.write() = greeting.to_string();
        Ok(())
    }

    fn service(&self, req: &mut Request, res: &mut Response) -> Result<(), HandlerError> {
        res.set_content_type("text/plain; charset=utf-8");
        res.write(format!("{} from {}\n", self.greeting.read(), req.path));
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load()?;
    let listen: SocketAddr = cfg
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address {}", cfg.listen_addr))?;

    let mut engine = EmbeddedEngine::new();
    engine.set_debug(cfg.debug_level);
    engine.set_work_dir(&cfg.work_dir);
    engine.register_class("hello", Hello::default);
    engine.add_endpoint(listen.port(), Some(listen.ip()), None);

    for context in &cfg.contexts {
        let ctx = engine.add_context(&context.path, &context.doc_root)?;
        ctx.set_reloadable(context.reloadable);
        engine.init_context(&ctx)?;
    }

    if cfg.contexts.is_empty() {
        // Nothing configured: serve the demo handler from an empty root.
        let root = cfg.work_dir.join("ROOT");
        std::fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;
        let doc_root = Url::from_directory_path(&root)
            .map_err(|_| anyhow::anyhow!("cannot express {} as a file URL", root.display()))?;

        let ctx = engine.add_context("/", doc_root.as_str())?;
        ctx.add_handler(HandlerWrapper::builder("hello").class("hello"));
        ctx.add_mapping("/hello/*", "hello");
        engine.init_context(&ctx)?;
    }

    engine.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    engine.stop().await;

    Ok(())
}

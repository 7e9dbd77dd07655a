//! Render command - render a skin file with the in-memory engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result, anyhow};
use clap::Args;
use kiln_core::memory::{FunctionTable, MemoryEngineFactory};
use kiln_core::{Application, EngineFactory, Exchange};
use kiln_types::ParamMap;
use tracing::debug;

use super::Context;

const SKIN_EXTENSION: &str = "skin";

/// Arguments for the render command.
#[derive(Args, Debug)]
pub struct RenderArgs {
    /// Skin file to render. Other skins in its directory can be extended.
    pub skin: PathBuf,

    /// Parameter passed to the skin as `param.<key>`
    #[arg(short, long = "param", value_parser = parse_key_val)]
    pub params: Vec<(String, String)>,

    /// Render this subskin instead of the main body
    #[arg(long)]
    pub subskin: Option<String>,
}

/// Run the render command.
pub fn run(args: RenderArgs, ctx: &Context) -> Result<()> {
    let name = skin_name(&args.skin)?;
    let source = std::fs::read_to_string(&args.skin)
        .with_context(|| format!("failed to read {}", args.skin.display()))?;

    let factory = Arc::new(MemoryEngineFactory::new(FunctionTable::new()));
    let mut builder = Application::builder(ctx.loaded.config.clone())
        .with_engine_factory(factory.clone())
        .with_skin("global", name.clone(), source);
    for (sibling, sibling_source) in sibling_skins(&args.skin, &name)? {
        debug!(skin = %sibling, "Registering sibling skin");
        builder = builder.with_skin("global", sibling, sibling_source);
    }
    let app = builder.build()?;

    let engine = factory.create();
    engine.init(app.context(), 0)?;
    let mut cx = Exchange::standalone(app.context().clone(), engine);

    let mut param = ParamMap::new();
    for (key, value) in args.params {
        param.insert(key, value);
    }
    let target = match &args.subskin {
        Some(sub) => format!("{name}#{sub}"),
        None => name,
    };
    let output = cx.render_skin_as_string(&target, None, Some(param))?;
    print!("{output}");
    Ok(())
}

fn skin_name(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("not a skin file: {}", path.display()))
}

/// Skins next to `path`, keyed by file stem.
fn sibling_skins(path: &Path, own_name: &str) -> Result<Vec<(String, String)>> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut skins = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let sibling = entry?.path();
        if sibling.extension().and_then(|e| e.to_str()) != Some(SKIN_EXTENSION) {
            continue;
        }
        let name = skin_name(&sibling)?;
        if name == own_name {
            continue;
        }
        let source = std::fs::read_to_string(&sibling)
            .with_context(|| format!("failed to read {}", sibling.display()))?;
        skins.push((name, source));
    }
    Ok(skins)
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got `{s}`"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("who=editor=chief").unwrap(),
            ("who".to_string(), "editor=chief".to_string())
        );
        assert!(parse_key_val("nothing").is_err());
    }

    #[test]
    fn test_skin_name_uses_stem() {
        assert_eq!(skin_name(Path::new("skins/page.skin")).unwrap(), "page");
    }
}

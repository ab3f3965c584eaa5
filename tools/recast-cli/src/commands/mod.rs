pub mod check;
pub mod export;
pub mod probe;

use std::sync::Arc;

use recast_common::config::DecodePath;
use recast_decode_engine::{DecoderRegistry, ElementFactory};
use recast_render_engine::ExportOptions;

pub fn parse_decode_path(value: &str) -> anyhow::Result<DecodePath> {
    match value {
        "auto" => Ok(DecodePath::Auto),
        "accelerated" => Ok(DecodePath::Accelerated),
        "fallback" => Ok(DecodePath::Fallback),
        _ => Err(anyhow::anyhow!(
            "Unknown decode path: {value}. Use: auto, accelerated, fallback"
        )),
    }
}

/// Element factory for the fallback path and the camera overlay.
pub fn element_factory(registry: &DecoderRegistry) -> Arc<dyn ElementFactory> {
    #[cfg(feature = "gstreamer")]
    {
        let _ = registry;
        Arc::new(recast_decode_engine::GstElementFactory)
    }
    #[cfg(not(feature = "gstreamer"))]
    {
        Arc::new(recast_decode_engine::DecodingElementFactory::new(registry.clone()))
    }
}

pub fn export_options() -> ExportOptions {
    let registry = DecoderRegistry::with_defaults();
    let elements = element_factory(&registry);
    ExportOptions {
        registry,
        camera_elements: elements.clone(),
        elements,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decode_path() {
        assert_eq!(parse_decode_path("fallback").unwrap(), DecodePath::Fallback);
        assert_eq!(parse_decode_path("auto").unwrap(), DecodePath::Auto);
        assert!(parse_decode_path("gpu").is_err());
    }
}

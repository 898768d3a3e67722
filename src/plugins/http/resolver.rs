use crate::core::model::{LinkInput, ResourceDescriptor};
use crate::plugins::registry::{DownloadItemDraft, LinkResolver, ResolveContext};
use sanitize_filename::sanitize;
use url::Url;

const FALLBACK_NAME: &str = "download.bin";

pub struct HttpResolver;

impl HttpResolver {
    pub fn new() -> Self { Self }
}

impl Default for HttpResolver {
    fn default() -> Self { Self::new() }
}

impl LinkResolver for HttpResolver {
    fn name(&self) -> &'static str { "http-resolver" }

    fn can_handle(&self, input: &LinkInput) -> u8 {
        if let Ok(u) = Url::parse(&input.raw) {
            if u.scheme() == "http" || u.scheme() == "https" { return 60; }
        }
        0
    }

    fn resolve(&self, input: &LinkInput, ctx: &ResolveContext) -> anyhow::Result<DownloadItemDraft> {
        let url = Url::parse(&input.raw)?;
        let filename = url
            .path_segments()
            .and_then(|mut s| s.next_back())
            .filter(|s| !s.is_empty())
            .map(sanitize)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| FALLBACK_NAME.to_string());

        let suggested_path = ctx.out_dir.join(&filename);
        let resource = ResourceDescriptor { uri: input.raw.clone(), headers: input.headers.clone() };

        Ok(DownloadItemDraft { display_name: filename, suggested_path, resource })
    }
}

//! Sitemap access: fetching/parsing the daily feed and discovering which
//! dates carry usable content.

pub mod discovery;
pub mod fetcher;

pub use discovery::SitemapDiscovery;
pub use fetcher::SitemapFetcher;

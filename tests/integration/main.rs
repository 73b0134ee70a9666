//! Integration tests: the full scan pipeline against mock sites.

mod mock_site;
mod pipeline;

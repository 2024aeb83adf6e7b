//! URL handling: normalization, SURT keys, and LIKE filtering
//!
//! Everything the crawler knows about a URL is derived here: the normalized
//! absolute form, the lowercase host used for per-host scheduling, the
//! path+query robots rules match against, and the SURT key used for
//! deduplication and sorting.

mod matcher;
mod normalize;
mod surt;

pub use matcher::matches_like;
pub use normalize::{host_of, normalize_url, path_with_query};
pub use surt::{surt_key, surt_to_url};

mod endpoint;
mod verdict;

pub use endpoint::{format_authority, Endpoint, Protocol, ProtocolHint, MIN_CANDIDATE_LEN};
pub use verdict::{Mobility, OriginInfo, Rejection, Tags, Verdict};

mod upstream;

pub use upstream::{basic_auth, parse_proxy_list, Upstream};

use fcgiwire_record::RecordConfig;

/// Default cap on the bytes buffered for one input stream: 16 MiB.
pub const DEFAULT_MAX_STREAM_SIZE: usize = 16 * 1024 * 1024;

/// Default FCGI_MAX_REQS: concurrent requests accepted on one multiplexed connection.
pub const DEFAULT_MAX_REQS: u32 = 16;

pub const FCGI_MAX_CONNS: &str = "FCGI_MAX_CONNS";
pub const FCGI_MAX_REQS: &str = "FCGI_MAX_REQS";
pub const FCGI_MPXS_CONNS: &str = "FCGI_MPXS_CONNS";

/// Values reported in answer to GetValues.
///
/// `None` means the name is not recognized and is left out of the reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagementValues {
    pub max_conns: Option<u32>,
    pub max_reqs: Option<u32>,
    pub mpxs_conns: Option<bool>,
}

impl Default for ManagementValues {
    fn default() -> Self {
        Self {
            max_conns: Some(1),
            max_reqs: Some(DEFAULT_MAX_REQS),
            mpxs_conns: Some(true),
        }
    }
}

impl ManagementValues {
    /// Value for a management variable name, rendered as ASCII decimal.
    pub fn lookup(&self, name: &[u8]) -> Option<String> {
        match name {
            n if n == FCGI_MAX_CONNS.as_bytes() => self.max_conns.map(|v| v.to_string()),
            n if n == FCGI_MAX_REQS.as_bytes() => self.max_reqs.map(|v| v.to_string()),
            n if n == FCGI_MPXS_CONNS.as_bytes() => {
                self.mpxs_conns.map(|v| if v { "1" } else { "0" }.to_string())
            }
            _ => None,
        }
    }
}

/// Configuration for a multiplexed connection.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Upper bound on one assembled input stream (Params, Stdin or Data).
    pub max_stream_size: usize,
    pub management: ManagementValues,
    pub record: RecordConfig,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_stream_size: DEFAULT_MAX_STREAM_SIZE,
            management: ManagementValues::default(),
            record: RecordConfig::default(),
        }
    }
}

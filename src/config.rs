use std::time::Duration;

macro_rules! builder {
    ($(($name:ident, $t:ty, $desc:expr)),*) => {
        $(
            #[doc=$desc]
            pub fn $name(mut self, to: $t) -> Config {
                self.$name = to;
                self
            }
        )*
    }
}

/// Tunables for an `RTable`.
///
/// ```
/// use std::time::Duration;
///
/// let config = rtable::Config::new()
///     .view_lease(Duration::from_secs(1))
///     .propagation_retries(4)
///     .background_repair(true);
///
/// assert_eq!(config.propagation_retries, 4);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    #[doc(hidden)]
    pub view_lease: Duration,
    #[doc(hidden)]
    pub propagation_retries: usize,
    #[doc(hidden)]
    pub retry_backoff: Duration,
    #[doc(hidden)]
    pub conversion_retries: usize,
    #[doc(hidden)]
    pub query_page_size: usize,
    #[doc(hidden)]
    pub background_repair: bool,
    #[doc(hidden)]
    pub repair_queue_depth: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            view_lease: Duration::from_secs(5),
            propagation_retries: 2,
            retry_backoff: Duration::from_millis(10),
            conversion_retries: 8,
            query_page_size: 1000,
            background_repair: false,
            repair_queue_depth: 1024,
        }
    }
}

impl Config {
    /// Returns a default `Config`
    pub fn new() -> Config {
        Self::default()
    }

    builder!(
        (view_lease, Duration, "how long a cached view is trusted before it is reloaded from the configuration source"),
        (propagation_retries, usize, "retries per tail replica before a replication gap is recorded"),
        (retry_backoff, Duration, "initial sleep between retries, doubled on every attempt"),
        (conversion_retries, usize, "attempts to stamp one row during conversion before giving up"),
        (query_page_size, usize, "rows fetched from the head per query page"),
        (background_repair, bool, "repair under-replicated rows on a background thread after writes"),
        (repair_queue_depth, usize, "pending keys the background repairer buffers before dropping new ones")
    );
}

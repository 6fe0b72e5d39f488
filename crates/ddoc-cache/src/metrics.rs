//! Provides access to the metrics system.
//!
//! The cache reports increment-only counters (`ddoc_cache.hit`,
//! `ddoc_cache.miss`, `ddoc_cache.recovery`) and a resident-entry gauge.
//! When no statsd sink is configured, every report is a no-op.

use std::collections::BTreeMap;
use std::net::ToSocketAddrs;
use std::sync::OnceLock;

use cadence::{Counted, Gauged, StatsdClient, UdpMetricSink};

static METRICS_CLIENT: OnceLock<MetricsClient> = OnceLock::new();

#[derive(Debug)]
pub struct MetricsClient {
    statsd_client: StatsdClient,
    tags: BTreeMap<String, String>,
}

impl MetricsClient {
    pub fn count(&self, id: &str, value: i64) {
        let mut metric = self.statsd_client.count_with_tags(id, value);
        for (tag, value) in self.tags.iter() {
            metric = metric.with_tag(tag, value);
        }
        metric.send();
    }

    pub fn gauge(&self, id: &str, value: u64) {
        let mut metric = self.statsd_client.gauge_with_tags(id, value);
        for (tag, value) in self.tags.iter() {
            metric = metric.with_tag(tag, value);
        }
        metric.send();
    }
}

/// Tell the metrics system to report to statsd.
///
/// Metrics are silently dropped until this is called. The `tags` are
/// attached to every reported metric.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    tags: BTreeMap<String, String>,
) -> std::io::Result<()> {
    let addrs: Vec<_> = host.to_socket_addrs()?.collect();
    if let Some(addr) = addrs.first() {
        tracing::info!("Reporting metrics to statsd at {addr}");
    }
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    let statsd_client = StatsdClient::from_sink(prefix, sink);

    METRICS_CLIENT
        .set(MetricsClient {
            statsd_client,
            tags,
        })
        .ok();
    Ok(())
}

/// Invoke a callback with the current statsd client.
///
/// If statsd is not configured the callback is not invoked. For the most
/// part the [`metric!`](crate::metric) macro should be used instead.
#[inline(always)]
pub fn with_client<F>(f: F)
where
    F: FnOnce(&MetricsClient),
{
    if let Some(client) = METRICS_CLIENT.get() {
        f(client);
    }
}

/// Emits a metric.
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr) => {
        $crate::metrics::with_client(|client| client.count($id, $value))
    };
    (gauge($id:expr) = $value:expr) => {
        $crate::metrics::with_client(|client| client.gauge($id, $value))
    };
}

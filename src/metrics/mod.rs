pub mod exporter;
pub mod server;

pub use exporter::PrometheusExporter;
pub use server::MetricsServer;

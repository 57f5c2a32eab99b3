//! Ride statistics printed when a ride stops.

use std::time::Duration;

use connection::MetricsSnapshot;
use distribution::ServerReport;
use observability::RideMetricsSummary;
use telemetry::AggregatorStats;

#[derive(Debug, Clone)]
pub struct RideStats {
    /// Wall time from start to shutdown, connecting included
    pub duration: Duration,

    pub summary: RideMetricsSummary,

    pub aggregated: AggregatorStats,

    /// Connection manager counters at stop
    pub connection: MetricsSnapshot,

    pub server: ServerReport,

    /// Where the ride was written, if it was
    pub recorded: Option<String>,
}

impl RideStats {
    /// Share of readings lost to full buffers, as a percentage
    pub fn drop_rate(&self) -> f64 {
        let total = self.connection.readings_received + self.connection.readings_dropped;
        if total > 0 {
            (self.connection.readings_dropped as f64 / total as f64) * 100.0
        } else {
            0.0
        }
    }

    pub fn print_summary(&self) {
        println!();
        print!("{}", self.summary);

        println!("\nDevices");
        println!("   ├─ Readings received: {}", self.connection.readings_received);
        println!(
            "   ├─ Readings dropped: {} ({:.2}%)",
            self.connection.readings_dropped,
            self.drop_rate()
        );
        println!("   ├─ Connects: {}", self.connection.connects);
        println!("   └─ Reconnect attempts: {}", self.connection.reconnect_attempts);

        if !self.aggregated.per_device.is_empty() {
            println!("\nSamples per device");
            for (address, count) in &self.aggregated.per_device {
                println!("   ├─ {}: {}", address, count);
            }
        }

        println!("\nViewers");
        println!("   ├─ Accepted: {}", self.server.accepted);
        println!("   ├─ Handshake failures: {}", self.server.handshake_failures);
        println!("   └─ Transport lost: {}", self.server.transport_lost);

        match &self.recorded {
            Some(path) => println!("\nRecorded to {}", path),
            None => println!("\nRide not recorded"),
        }
        println!("Wall time: {:.1}s", self.duration.as_secs_f64());
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_rate() {
        let stats = RideStats {
            duration: Duration::from_secs(60),
            summary: RideMetricsSummary::default(),
            aggregated: AggregatorStats::default(),
            connection: MetricsSnapshot {
                readings_received: 90,
                readings_dropped: 10,
                ..Default::default()
            },
            server: ServerReport::default(),
            recorded: None,
        };
        assert!((stats.drop_rate() - 10.0).abs() < 1e-9);
    }
}

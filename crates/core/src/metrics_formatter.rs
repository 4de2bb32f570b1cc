#![allow(clippy::format_push_string)]

use crate::metrics::MetricsSnapshot;

pub struct MetricsFormatter;

impl MetricsFormatter {
    #[must_use]
    pub fn format(metrics: &MetricsSnapshot) -> String {
        let mut output = String::new();

        output.push('\n');
        output.push_str("═══════════════════════════════════════════════════════════════\n");
        output.push_str("                    EXECUTION SUMMARY                          \n");
        output.push_str("═══════════════════════════════════════════════════════════════\n");
        output.push('\n');

        output.push_str("Cycles\n");
        output.push_str("───────────────────────────────────────────────────────────────\n");
        output.push_str(&format!(
            "Dispatched:            {}\n",
            metrics.opportunities_dispatched
        ));
        output.push_str(&format!("Leg cycles started:    {}\n", metrics.cycles_started));
        output.push_str(&format!("Hedged legs:           {}\n", metrics.cycles_hedged));
        output.push_str(&format!("Placed legs:           {}\n", metrics.legs_placed));
        output.push_str(&format!("Failed legs:           {}\n", metrics.legs_failed));
        output.push_str(&format!("Abandoned:             {}\n", metrics.cycles_abandoned));
        output.push_str(&format!("Drained partner tasks: {}\n", metrics.tasks_drained));
        output.push('\n');

        output.push_str("Rollbacks\n");
        output.push_str("───────────────────────────────────────────────────────────────\n");
        output.push_str(&format!("Requested:             {}\n", metrics.rollbacks_requested));
        output.push_str(&format!("Succeeded:             {}\n", metrics.rollbacks_succeeded));
        output.push_str(&format!("Failed:                {}\n", metrics.rollbacks_failed));
        output.push('\n');

        output.push_str("Retry Registry\n");
        output.push_str("───────────────────────────────────────────────────────────────\n");
        output.push_str(&format!("Registered:            {}\n", metrics.retries_registered));
        output.push_str(&format!("Matched:               {}\n", metrics.retries_matched));
        output.push_str(&format!("Evicted:               {}\n", metrics.retries_evicted));
        output.push_str(&format!(
            "Signals dropped:       {}\n",
            metrics.ready_signals_dropped
        ));

        output.push('\n');
        output.push_str("═══════════════════════════════════════════════════════════════\n");

        if metrics.rollbacks_failed > 0 {
            output.push_str("\n⚠️  Unhedged positions remain open. Operator action required.\n\n");
        }

        output
    }
}

//! Boot-time tunables for the interrupt subsystem.

use hvirq_lib::MAX_CPUS;

const DEFAULT_MAX_GUESTS: usize = 32;
const DEFAULT_RATELIMIT: u32 = 10_000;
const DEFAULT_NR_CPUS: usize = 4;
const DEFAULT_NR_IRQS_GSI: u32 = 48;
const DEFAULT_NR_IRQS: u32 = 256;

/// Which `used_vectors` bitmap, if any, an IRQ's vector must stay out of.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VectorMapPolicy {
    None,
    /// Every IRQ shares one bitmap: no two IRQs get the same vector anywhere.
    Global,
    /// MSI IRQs of one PCI function never share a vector.
    PerDevice,
}

impl VectorMapPolicy {
    pub fn from_str(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("none") {
            Some(VectorMapPolicy::None)
        } else if value.eq_ignore_ascii_case("global") {
            Some(VectorMapPolicy::Global)
        } else if value.eq_ignore_ascii_case("per-device") {
            Some(VectorMapPolicy::PerDevice)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VectorMapPolicy::None => "none",
            VectorMapPolicy::Global => "global",
            VectorMapPolicy::PerDevice => "per-device",
        }
    }
}

impl core::fmt::Display for VectorMapPolicy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// CPUs that must agree on a vector when one of them is chosen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VectorGrouping {
    /// Physical/flat destination mode: every CPU allocates alone.
    PerCpu,
    /// Logical cluster mode: CPUs `[k*n, (k+1)*n)` share a vector.
    Cluster(usize),
}

#[derive(Clone, Copy, Debug)]
pub struct IrqConfig {
    pub nr_cpus: usize,
    /// IRQs below this are GSIs; dynamic (MSI) IRQs live above.
    pub nr_irqs_gsi: u32,
    pub nr_irqs: u32,
    pub irq_max_guests: usize,
    /// Deliveries allowed per 10ms window on a guest IRQ; 0 disables.
    pub ratelimit_threshold: u32,
    pub vector_map: VectorMapPolicy,
    pub grouping: VectorGrouping,
    /// Keep guest IRQs where they are instead of following the bound VCPU.
    pub noirqbalance: bool,
}

impl Default for IrqConfig {
    fn default() -> Self {
        Self {
            nr_cpus: DEFAULT_NR_CPUS,
            nr_irqs_gsi: DEFAULT_NR_IRQS_GSI,
            nr_irqs: DEFAULT_NR_IRQS,
            irq_max_guests: DEFAULT_MAX_GUESTS,
            ratelimit_threshold: DEFAULT_RATELIMIT,
            vector_map: VectorMapPolicy::None,
            grouping: VectorGrouping::PerCpu,
            noirqbalance: false,
        }
    }
}

impl IrqConfig {
    pub fn from_cmdline(cmdline: Option<&str>) -> Self {
        let mut cfg = IrqConfig::default();
        if let Some(cmdline) = cmdline {
            for token in cmdline.split_whitespace() {
                if let Some(value) = token.strip_prefix("irq_max_guests=") {
                    if let Ok(n) = value.parse::<usize>() {
                        cfg.irq_max_guests = n.clamp(1, 255);
                    }
                } else if let Some(value) = token.strip_prefix("irq_ratelimit=") {
                    if let Ok(n) = value.parse::<u32>() {
                        cfg.ratelimit_threshold = n;
                    }
                } else if let Some(value) = token.strip_prefix("irq_vector_map=") {
                    if let Some(policy) = VectorMapPolicy::from_str(value) {
                        cfg.vector_map = policy;
                    }
                } else if token == "noirqbalance" {
                    cfg.noirqbalance = true;
                } else if let Some(value) = token.strip_prefix("noirqbalance=") {
                    if let Some(b) = parse_bool(value) {
                        cfg.noirqbalance = b;
                    }
                } else if let Some(value) = token.strip_prefix("vector_cluster=") {
                    if let Ok(n) = value.parse::<usize>() {
                        cfg.grouping = VectorGrouping::Cluster(n);
                    }
                } else if let Some(value) = token.strip_prefix("nr_irqs_gsi=") {
                    if let Ok(n) = value.parse::<u32>() {
                        cfg.nr_irqs_gsi = n;
                    }
                } else if let Some(value) = token.strip_prefix("nr_irqs=") {
                    if let Ok(n) = value.parse::<u32>() {
                        cfg.nr_irqs = n;
                    }
                } else if let Some(value) = token.strip_prefix("nr_cpus=") {
                    if let Ok(n) = value.parse::<usize>() {
                        cfg.nr_cpus = n.clamp(1, MAX_CPUS);
                    }
                }
            }
        }
        cfg.sanitize();
        cfg
    }

    /// Keep the IRQ space consistent: the GSI range must cover the legacy
    /// lines and leave room below `nr_irqs`. A cluster of one CPU or fewer
    /// is per-CPU allocation.
    pub fn sanitize(&mut self) {
        self.nr_cpus = self.nr_cpus.clamp(1, MAX_CPUS);
        if let VectorGrouping::Cluster(n) = self.grouping {
            self.grouping = match n {
                0 | 1 => VectorGrouping::PerCpu,
                n => VectorGrouping::Cluster(n.min(MAX_CPUS)),
            };
        }
        self.nr_irqs_gsi = self.nr_irqs_gsi.max(hvirq_abi::NR_LEGACY_IRQS);
        self.nr_irqs = self.nr_irqs.max(self.nr_irqs_gsi);
        self.irq_max_guests = self.irq_max_guests.clamp(1, 255);
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("on")
        || value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("yes")
        || value == "1"
    {
        Some(true)
    } else if value.eq_ignore_ascii_case("off")
        || value.eq_ignore_ascii_case("false")
        || value.eq_ignore_ascii_case("no")
        || value == "0"
    {
        Some(false)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = IrqConfig::from_cmdline(None);
        assert_eq!(cfg.irq_max_guests, 32);
        assert_eq!(cfg.ratelimit_threshold, 10_000);
        assert_eq!(cfg.vector_map, VectorMapPolicy::None);
        assert_eq!(cfg.grouping, VectorGrouping::PerCpu);
        assert!(!cfg.noirqbalance);
    }

    #[test]
    fn test_cmdline_tokens() {
        let cfg = IrqConfig::from_cmdline(Some(
            "console=com1 irq_max_guests=4 irq_ratelimit=0 irq_vector_map=per-device \
             noirqbalance vector_cluster=4 nr_cpus=8 nr_irqs_gsi=24 nr_irqs=128",
        ));
        assert_eq!(cfg.irq_max_guests, 4);
        assert_eq!(cfg.ratelimit_threshold, 0);
        assert_eq!(cfg.vector_map, VectorMapPolicy::PerDevice);
        assert!(cfg.noirqbalance);
        assert_eq!(cfg.grouping, VectorGrouping::Cluster(4));
        assert_eq!(cfg.nr_cpus, 8);
        assert_eq!(cfg.nr_irqs_gsi, 24);
        assert_eq!(cfg.nr_irqs, 128);
    }

    #[test]
    fn test_cmdline_clamps_and_ignores_garbage() {
        let cfg = IrqConfig::from_cmdline(Some(
            "irq_max_guests=0 irq_vector_map=bogus noirqbalance=off nr_irqs_gsi=3 nr_irqs=1",
        ));
        assert_eq!(cfg.irq_max_guests, 1);
        assert_eq!(cfg.vector_map, VectorMapPolicy::None);
        assert!(!cfg.noirqbalance);
        assert_eq!(cfg.nr_irqs_gsi, 16);
        assert_eq!(cfg.nr_irqs, 16);

        let cfg = IrqConfig::from_cmdline(Some("irq_max_guests=1000"));
        assert_eq!(cfg.irq_max_guests, 255);
    }

    #[test]
    fn test_sanitize_normalizes_cluster_size() {
        let mut cfg = IrqConfig {
            grouping: VectorGrouping::Cluster(0),
            ..IrqConfig::default()
        };
        cfg.sanitize();
        assert_eq!(cfg.grouping, VectorGrouping::PerCpu);

        cfg.grouping = VectorGrouping::Cluster(1);
        cfg.sanitize();
        assert_eq!(cfg.grouping, VectorGrouping::PerCpu);

        cfg.grouping = VectorGrouping::Cluster(MAX_CPUS * 4);
        cfg.sanitize();
        assert_eq!(cfg.grouping, VectorGrouping::Cluster(MAX_CPUS));

        let cfg = IrqConfig::from_cmdline(Some("vector_cluster=1"));
        assert_eq!(cfg.grouping, VectorGrouping::PerCpu);
    }
}

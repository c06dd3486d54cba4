use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
pub struct SimConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub nic: NicConfig,
    #[serde(default)]
    pub memory_server: MemoryServerConfig,
    pub index: IndexConfig,
    #[serde(default)]
    pub sherman: ShermanConfig,
    #[serde(default)]
    pub dex: DexConfig,
    pub workloads: Vec<WorkloadConfig>,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "defaults::compute_nodes")]
    pub compute_nodes: u32,
    #[serde(default = "defaults::memory_nodes")]
    pub memory_nodes: u32,
    #[serde(default = "defaults::threads_per_compute")]
    pub threads_per_compute: u32,
    #[serde(default = "defaults::cs_cache_bytes")]
    pub cs_cache_bytes: u64,
    #[serde(default = "defaults::ms_cpu_cores")]
    pub ms_cpu_cores: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            compute_nodes: defaults::compute_nodes(),
            memory_nodes: defaults::memory_nodes(),
            threads_per_compute: defaults::threads_per_compute(),
            cs_cache_bytes: defaults::cs_cache_bytes(),
            ms_cpu_cores: defaults::ms_cpu_cores(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct IopsCaps {
    #[serde(default = "defaults::iops_cas")]
    pub cas: f64,
    #[serde(default = "defaults::iops_read_small")]
    pub read_small: f64,
    #[serde(default = "defaults::iops_write_small")]
    pub write_small: f64,
}

impl Default for IopsCaps {
    fn default() -> Self {
        Self {
            cas: defaults::iops_cas(),
            read_small: defaults::iops_read_small(),
            write_small: defaults::iops_write_small(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct NicConfig {
    #[serde(default = "defaults::link_gbps")]
    pub link_gbps: f64,
    #[serde(default = "defaults::base_rtt_us")]
    pub base_rtt_us: f64,
    #[serde(default = "defaults::per_byte_us")]
    pub per_byte_us: f64,
    #[serde(default = "defaults::cas_onchip_rtt_us")]
    pub cas_onchip_rtt_us: f64,
    #[serde(default)]
    pub iops_caps_per_qp: IopsCaps,
    #[serde(default = "defaults::qp_per_thread")]
    pub qp_per_thread: u32,
    #[serde(default = "defaults::in_order_rc")]
    pub in_order_rc: bool,
    #[serde(default = "defaults::tb_cas_ops_per_s")]
    pub tb_cas_ops_per_s: f64,
    #[serde(default = "defaults::tb_read_ops_per_s")]
    pub tb_read_ops_per_s: f64,
    #[serde(default = "defaults::tb_write_ops_per_s")]
    pub tb_write_ops_per_s: f64,
    #[serde(default = "defaults::tb_burst_ops")]
    pub tb_burst_ops: f64,
    #[serde(default = "defaults::small_threshold")]
    pub small_threshold: u64,
    #[serde(default = "defaults::pcie_doorbell_us")]
    pub pcie_doorbell_us: f64,
    #[serde(default = "defaults::pcie_desc_us")]
    pub pcie_desc_us: f64,
    #[serde(default = "defaults::doorbell_batch_limit")]
    pub doorbell_batch_limit: u32,
    #[serde(default = "defaults::sq_depth")]
    pub sq_depth: i64,
}

impl Default for NicConfig {
    fn default() -> Self {
        Self {
            link_gbps: defaults::link_gbps(),
            base_rtt_us: defaults::base_rtt_us(),
            per_byte_us: defaults::per_byte_us(),
            cas_onchip_rtt_us: defaults::cas_onchip_rtt_us(),
            iops_caps_per_qp: IopsCaps::default(),
            qp_per_thread: defaults::qp_per_thread(),
            in_order_rc: defaults::in_order_rc(),
            tb_cas_ops_per_s: defaults::tb_cas_ops_per_s(),
            tb_read_ops_per_s: defaults::tb_read_ops_per_s(),
            tb_write_ops_per_s: defaults::tb_write_ops_per_s(),
            tb_burst_ops: defaults::tb_burst_ops(),
            small_threshold: defaults::small_threshold(),
            pcie_doorbell_us: defaults::pcie_doorbell_us(),
            pcie_desc_us: defaults::pcie_desc_us(),
            doorbell_batch_limit: defaults::doorbell_batch_limit(),
            sq_depth: defaults::sq_depth(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MemoryServerConfig {
    #[serde(default = "defaults::rnic_onchip_bytes")]
    pub rnic_onchip_bytes: u64,
    #[serde(default = "defaults::dram_latency_us")]
    pub dram_latency_us: f64,
}

impl Default for MemoryServerConfig {
    fn default() -> Self {
        Self {
            rnic_onchip_bytes: defaults::rnic_onchip_bytes(),
            dram_latency_us: defaults::dram_latency_us(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Sherman,
    Dex,
}

impl std::fmt::Display for IndexKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexKind::Sherman => write!(f, "Sherman"),
            IndexKind::Dex => write!(f, "Dex"),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ShermanAblations {
    #[serde(default)]
    pub disable_combine: bool,
    #[serde(default)]
    pub disable_hocl: bool,
    #[serde(default)]
    pub disable_versions: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct DexAblations {
    #[serde(default)]
    pub disable_partitioning: bool,
    #[serde(default)]
    pub disable_path_cache: bool,
    #[serde(default)]
    pub disable_offload: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct AblationsConfig {
    #[serde(default)]
    pub sherman: ShermanAblations,
    #[serde(default)]
    pub dex: DexAblations,
}

#[derive(Debug, Deserialize)]
pub struct IndexConfig {
    pub kind: IndexKind,
    #[serde(default = "defaults::node_bytes")]
    pub node_bytes: u64,
    #[serde(default = "defaults::leaf_entry_bytes")]
    pub leaf_entry_bytes: u64,
    #[serde(default)]
    pub ablations: AblationsConfig,
}

#[derive(Debug, Deserialize)]
pub struct HoclConfig {
    #[serde(default = "defaults::hocl_enable")]
    pub enable: bool,
    #[serde(default = "defaults::glt_slots")]
    pub glt_slots: u32,
    #[serde(default = "defaults::llt_enable")]
    pub llt_enable: bool,
    #[serde(default = "defaults::llt_local_wait_us")]
    pub llt_local_wait_us: f64,
}

impl Default for HoclConfig {
    fn default() -> Self {
        Self {
            enable: defaults::hocl_enable(),
            glt_slots: defaults::glt_slots(),
            llt_enable: defaults::llt_enable(),
            llt_local_wait_us: defaults::llt_local_wait_us(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum CollisionPolicy {
    Bypass,
    Queue,
}

#[derive(Debug, Deserialize)]
pub struct RdwcConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "defaults::rdwc_window_us")]
    pub window_us: f64,
    #[serde(default = "defaults::collision_policy")]
    pub collision_policy: CollisionPolicy,
}

impl Default for RdwcConfig {
    fn default() -> Self {
        Self {
            enable: false,
            window_us: defaults::rdwc_window_us(),
            collision_policy: defaults::collision_policy(),
        }
    }
}

/// Hopscotch leaf overlay knobs, not present in the original flat schema
/// but wired in from the reference header's `HopscotchConf`.
#[derive(Debug, Deserialize)]
pub struct HopscotchConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "defaults::hopscotch_h")]
    pub h: u32,
    #[serde(default = "defaults::hopscotch_slots_per_leaf")]
    pub slots_per_leaf: u32,
    #[serde(default)]
    pub enable_speculative: bool,
    #[serde(default = "defaults::hopscotch_topk")]
    pub topk: u32,
    #[serde(default = "defaults::hopscotch_rebuild_threshold")]
    pub rebuild_threshold: u32,
}

impl Default for HopscotchConfig {
    fn default() -> Self {
        Self {
            enable: false,
            h: defaults::hopscotch_h(),
            slots_per_leaf: defaults::hopscotch_slots_per_leaf(),
            enable_speculative: false,
            topk: defaults::hopscotch_topk(),
            rebuild_threshold: defaults::hopscotch_rebuild_threshold(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ShermanConfig {
    #[serde(default = "defaults::combine_commands")]
    pub combine_commands: bool,
    #[serde(default)]
    pub hocl: HoclConfig,
    #[serde(default = "defaults::two_level_versioning")]
    pub two_level_versioning: bool,
    #[serde(default = "defaults::cache_levels")]
    pub cache_levels: u32,
    #[serde(default = "defaults::glt_hash_seed")]
    pub glt_hash_seed: u64,
    #[serde(default = "defaults::cas_max_retries")]
    pub cas_max_retries: u32,
    #[serde(default = "defaults::cas_backoff_us")]
    pub cas_backoff_us: f64,
    #[serde(default)]
    pub model_glt_collisions: bool,
    #[serde(default = "defaults::leaf_max_entries")]
    pub leaf_max_entries: u32,
    #[serde(default = "defaults::split_threshold")]
    pub split_threshold: u32,
    #[serde(default = "defaults::merge_threshold")]
    pub merge_threshold: u32,
    #[serde(default)]
    pub enable_splits: bool,
    #[serde(default)]
    pub enable_merges: bool,
    #[serde(default = "defaults::enable_two_level_versions")]
    pub enable_two_level_versions: bool,
    #[serde(default)]
    pub rdwc: RdwcConfig,
    #[serde(default)]
    pub hopscotch: HopscotchConfig,
}

impl Default for ShermanConfig {
    fn default() -> Self {
        Self {
            combine_commands: defaults::combine_commands(),
            hocl: HoclConfig::default(),
            two_level_versioning: defaults::two_level_versioning(),
            cache_levels: defaults::cache_levels(),
            glt_hash_seed: defaults::glt_hash_seed(),
            cas_max_retries: defaults::cas_max_retries(),
            cas_backoff_us: defaults::cas_backoff_us(),
            model_glt_collisions: false,
            leaf_max_entries: defaults::leaf_max_entries(),
            split_threshold: defaults::split_threshold(),
            merge_threshold: defaults::merge_threshold(),
            enable_splits: false,
            enable_merges: false,
            enable_two_level_versions: defaults::enable_two_level_versions(),
            rdwc: RdwcConfig::default(),
            hopscotch: HopscotchConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OffloadConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "defaults::ms_cpu_budget_ops_per_s")]
    pub ms_cpu_budget_ops_per_s: f64,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            enable: false,
            ms_cpu_budget_ops_per_s: defaults::ms_cpu_budget_ops_per_s(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DexConfig {
    #[serde(default = "defaults::logical_partitioning")]
    pub logical_partitioning: bool,
    #[serde(default = "defaults::path_aware_cache")]
    pub path_aware_cache: bool,
    #[serde(default)]
    pub offload: OffloadConfig,
    #[serde(default = "defaults::num_partitions")]
    pub num_partitions: u32,
    #[serde(default = "defaults::repartition_period_ms")]
    pub repartition_period_ms: f64,
    #[serde(default = "defaults::repartition_topk")]
    pub repartition_topk: u32,
    #[serde(default = "defaults::remap_broadcast_us")]
    pub remap_broadcast_us: f64,
    #[serde(default = "defaults::cache_inval_prob")]
    pub cache_inval_prob: f64,
}

impl Default for DexConfig {
    fn default() -> Self {
        Self {
            logical_partitioning: defaults::logical_partitioning(),
            path_aware_cache: defaults::path_aware_cache(),
            offload: OffloadConfig::default(),
            num_partitions: defaults::num_partitions(),
            repartition_period_ms: defaults::repartition_period_ms(),
            repartition_topk: defaults::repartition_topk(),
            remap_broadcast_us: defaults::remap_broadcast_us(),
            cache_inval_prob: defaults::cache_inval_prob(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MixConfig {
    #[serde(default = "defaults::mix_read")]
    pub read: f64,
    #[serde(default = "defaults::mix_write")]
    pub write: f64,
}

impl Default for MixConfig {
    fn default() -> Self {
        Self {
            read: defaults::mix_read(),
            write: defaults::mix_write(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WorkloadConfig {
    pub name: String,
    pub ops: u64,
    #[serde(default)]
    pub mix: MixConfig,
    #[serde(default = "defaults::keyspace")]
    pub keyspace: u64,
    #[serde(default = "defaults::zipf")]
    pub zipf: f64,
    #[serde(default = "defaults::range_len")]
    pub range_len: u32,
}

#[derive(Debug, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "defaults::ptiles")]
    pub ptiles: Vec<f64>,
    #[serde(default)]
    pub dump_per_op_trace: bool,
    #[serde(default = "defaults::out_dir")]
    pub out_dir: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            ptiles: defaults::ptiles(),
            dump_per_op_trace: false,
            out_dir: defaults::out_dir(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] serde_yaml::Error),
}

impl SimConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config: SimConfig = serde_yaml::from_str(&yaml)?;
        Ok(config)
    }
}

mod defaults {
    use super::CollisionPolicy;

    pub fn compute_nodes() -> u32 {
        4
    }
    pub fn memory_nodes() -> u32 {
        2
    }
    pub fn threads_per_compute() -> u32 {
        4
    }
    pub fn cs_cache_bytes() -> u64 {
        16 << 20
    }
    pub fn ms_cpu_cores() -> u32 {
        8
    }

    pub fn link_gbps() -> f64 {
        100.0
    }
    pub fn base_rtt_us() -> f64 {
        2.0
    }
    pub fn per_byte_us() -> f64 {
        0.00008
    }
    pub fn cas_onchip_rtt_us() -> f64 {
        0.7
    }
    pub fn iops_cas() -> f64 {
        120e6
    }
    pub fn iops_read_small() -> f64 {
        8.5e6
    }
    pub fn iops_write_small() -> f64 {
        9.0e6
    }
    pub fn qp_per_thread() -> u32 {
        1
    }
    pub fn in_order_rc() -> bool {
        true
    }
    pub fn tb_cas_ops_per_s() -> f64 {
        120e6
    }
    pub fn tb_read_ops_per_s() -> f64 {
        8.5e6
    }
    pub fn tb_write_ops_per_s() -> f64 {
        9.0e6
    }
    pub fn tb_burst_ops() -> f64 {
        64.0
    }
    pub fn small_threshold() -> u64 {
        256
    }
    pub fn pcie_doorbell_us() -> f64 {
        0.25
    }
    pub fn pcie_desc_us() -> f64 {
        0.03
    }
    pub fn doorbell_batch_limit() -> u32 {
        16
    }
    pub fn sq_depth() -> i64 {
        512
    }

    pub fn rnic_onchip_bytes() -> u64 {
        256
    }
    pub fn dram_latency_us() -> f64 {
        0.1
    }

    pub fn node_bytes() -> u64 {
        4096
    }
    pub fn leaf_entry_bytes() -> u64 {
        24
    }

    pub fn hocl_enable() -> bool {
        true
    }
    pub fn glt_slots() -> u32 {
        1024
    }
    pub fn llt_enable() -> bool {
        true
    }
    pub fn llt_local_wait_us() -> f64 {
        0.2
    }

    pub fn rdwc_window_us() -> f64 {
        100.0
    }
    pub fn collision_policy() -> CollisionPolicy {
        CollisionPolicy::Bypass
    }

    pub fn hopscotch_h() -> u32 {
        8
    }
    pub fn hopscotch_slots_per_leaf() -> u32 {
        64
    }
    pub fn hopscotch_topk() -> u32 {
        16
    }
    pub fn hopscotch_rebuild_threshold() -> u32 {
        4
    }

    pub fn combine_commands() -> bool {
        true
    }
    pub fn two_level_versioning() -> bool {
        true
    }
    pub fn cache_levels() -> u32 {
        2
    }
    pub fn glt_hash_seed() -> u64 {
        0x9e3779b97f4a7c15
    }
    pub fn cas_max_retries() -> u32 {
        8
    }
    pub fn cas_backoff_us() -> f64 {
        0.5
    }
    pub fn leaf_max_entries() -> u32 {
        64
    }
    pub fn split_threshold() -> u32 {
        56
    }
    pub fn merge_threshold() -> u32 {
        16
    }
    pub fn enable_two_level_versions() -> bool {
        true
    }

    pub fn logical_partitioning() -> bool {
        true
    }
    pub fn path_aware_cache() -> bool {
        true
    }
    pub fn ms_cpu_budget_ops_per_s() -> f64 {
        2e6
    }
    pub fn num_partitions() -> u32 {
        64
    }
    pub fn repartition_period_ms() -> f64 {
        10.0
    }
    pub fn repartition_topk() -> u32 {
        4
    }
    pub fn remap_broadcast_us() -> f64 {
        1.0
    }
    pub fn cache_inval_prob() -> f64 {
        0.1
    }

    pub fn mix_read() -> f64 {
        0.9
    }
    pub fn mix_write() -> f64 {
        0.1
    }
    pub fn keyspace() -> u64 {
        1_000_000
    }
    pub fn zipf() -> f64 {
        0.99
    }
    pub fn range_len() -> u32 {
        1
    }

    pub fn ptiles() -> Vec<f64> {
        vec![50.0, 95.0, 99.0]
    }
    pub fn out_dir() -> String {
        "data/out".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_in_defaults() {
        let yaml = r#"
index:
  kind: sherman
workloads:
  - name: smoke
    ops: 100
"#;
        let cfg: SimConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.cluster.compute_nodes, 4);
        assert_eq!(cfg.index.kind, IndexKind::Sherman);
        assert_eq!(cfg.workloads[0].ops, 100);
        assert_eq!(cfg.sherman.glt_hash_seed, 0x9e3779b97f4a7c15);
    }

    #[test]
    fn unknown_index_kind_fails_to_parse() {
        let yaml = r#"
index:
  kind: bogus
workloads: []
"#;
        let result: Result<SimConfig, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn load_missing_file_surfaces_read_error() {
        let err = SimConfig::load("/nonexistent/path/does-not-exist.yaml".to_string())
            .expect_err("should fail to read");
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}

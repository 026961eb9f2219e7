use std::{
    fs,
    io,
    path::{
        Path,
        PathBuf,
    },
};

/// Directory tree a node's collection writes into. Every capture has its own
/// subtree keyed by node name so trees from many nodes merge without clashes.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputLayout {
    root: PathBuf,
    node: String,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>, node: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            node: node.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    fn per_node(&self, kind: &str) -> PathBuf {
        self.root.join(kind).join(&self.node)
    }

    pub fn configuration_dir(&self) -> PathBuf {
        self.per_node("configuration")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.per_node("logs")
    }

    pub fn queries_dir(&self) -> PathBuf {
        self.per_node("queries")
    }

    pub fn node_info_dir(&self) -> PathBuf {
        self.per_node("node-info")
    }

    pub fn jfr_dir(&self) -> PathBuf {
        self.root.join("jfr")
    }

    pub fn jfr_file(&self) -> PathBuf {
        self.jfr_dir().join(format!("{}.jfr", self.node))
    }

    pub fn thread_dumps_dir(&self) -> PathBuf {
        self.jfr_dir().join("thread-dumps").join(&self.node)
    }

    pub fn ttop_dir(&self) -> PathBuf {
        self.per_node("ttop")
    }

    pub fn heap_dumps_dir(&self) -> PathBuf {
        self.root.join("heap-dumps")
    }

    pub fn kubernetes_dir(&self) -> PathBuf {
        self.root.join("kubernetes")
    }

    pub fn system_tables_dir(&self) -> PathBuf {
        self.per_node("system-tables")
    }

    pub fn wlm_dir(&self) -> PathBuf {
        self.per_node("wlm")
    }

    pub fn kvstore_dir(&self) -> PathBuf {
        self.per_node("kvstore")
    }

    pub fn job_profiles_dir(&self) -> PathBuf {
        self.per_node("job-profiles")
    }

    pub fn cluster_stats_dir(&self) -> PathBuf {
        self.per_node("cluster-stats")
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join(format!("ddc-{}.log", self.node))
    }

    pub fn create_all(&self) -> io::Result<()> {
        for dir in [
            self.configuration_dir(),
            self.logs_dir(),
            self.queries_dir(),
            self.node_info_dir(),
            self.thread_dumps_dir(),
            self.ttop_dir(),
            self.heap_dumps_dir(),
            self.system_tables_dir(),
            self.wlm_dir(),
            self.kvstore_dir(),
            self.job_profiles_dir(),
            self.cluster_stats_dir(),
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_keyed_paths() {
        let layout = OutputLayout::new("/tmp/ddc/out", "node-1");
        assert_eq!(layout.logs_dir(), PathBuf::from("/tmp/ddc/out/logs/node-1"));
        assert_eq!(layout.jfr_file(), PathBuf::from("/tmp/ddc/out/jfr/node-1.jfr"));
        assert_eq!(layout.thread_dumps_dir(), PathBuf::from("/tmp/ddc/out/jfr/thread-dumps/node-1"));
        assert_eq!(
            layout.cluster_stats_dir().join("cluster-stats.json"),
            PathBuf::from("/tmp/ddc/out/cluster-stats/node-1/cluster-stats.json")
        );
        assert_eq!(layout.log_file(), PathBuf::from("/tmp/ddc/out/ddc-node-1.log"));
    }
}

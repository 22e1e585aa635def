use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use fleetbench_core::scenario::{RepeatNode, ScaleNode, Scenario, ScenarioNode, StageNode};
use fleetbench_core::Capability;
use fleetbench_testservice::MemberOptions;
use fleetbench_value::Value;
use serde::Deserialize;

const DEFAULT_CONFIGURATION: &str = "default";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct BenchmarkYaml {
    #[serde(default)]
    clusters: Vec<ClusterYaml>,

    #[serde(default)]
    configurations: Vec<ConfigurationYaml>,

    #[serde(default)]
    defaults: DefaultsYaml,

    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    scenario: Vec<NodeYaml>,

    #[serde(default)]
    reports: Vec<ReportYaml>,
}

/// `clusters: [1, 2]` or `clusters: [{ size: 1 }, { size: 2 }]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ClusterYaml {
    Size(usize),
    Sized { size: usize },
}

impl ClusterYaml {
    fn size(&self) -> usize {
        match self {
            Self::Size(size) | Self::Sized { size } => *size,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ConfigurationYaml {
    name: String,

    #[serde(default)]
    service: ServiceYaml,

    /// Bound as scenario variables for every run of this configuration.
    #[serde(default)]
    properties: BTreeMap<String, Value>,
}

/// Knobs of the in-process grid members backing each slave.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ServiceYaml {
    #[serde(default)]
    start_delay: Option<YamlDuration>,

    #[serde(default)]
    fail_on_start: bool,

    /// Capability names (kebab-case) the members do not provide.
    #[serde(default)]
    without: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct DefaultsYaml {
    #[serde(default)]
    stage_timeout: Option<YamlDuration>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
enum NodeYaml {
    Stage(StageSpecYaml),
    Repeat(RepeatYaml),
    Scale(ScaleYaml),
    Define(DefineYaml),
    #[serde(alias = "analyze-test")]
    AnalyzeTest(BTreeMap<String, Value>),
}

/// `stage: service-start` or a map with `name` plus stage properties.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum StageSpecYaml {
    Name(String),
    Full(StageYaml),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StageYaml {
    name: String,

    #[serde(default)]
    advisory: bool,

    #[serde(default)]
    timeout: Option<Value>,

    #[serde(default)]
    slaves: Option<Value>,

    #[serde(flatten)]
    properties: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RepeatYaml {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    times: Option<Value>,
    #[serde(default)]
    from: Option<Value>,
    #[serde(default)]
    to: Option<Value>,
    #[serde(default)]
    inc: Option<Value>,
    body: Vec<NodeYaml>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ScaleYaml {
    #[serde(default)]
    from: Option<Value>,
    #[serde(default)]
    to: Option<Value>,
    #[serde(default)]
    inc: Option<Value>,
    body: Vec<NodeYaml>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct DefineYaml {
    name: String,
    value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
pub(crate) enum ReportYaml {
    /// All reports of the invocation as one JSON document.
    Json { path: PathBuf },
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct YamlDuration(Duration);

impl YamlDuration {
    fn into_inner(self) -> Duration {
        self.0
    }
}

impl<'de> Deserialize<'de> for YamlDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl<'de> serde::de::Visitor<'de> for V {
            type Value = YamlDuration;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("duration as string (e.g. 10s), integer seconds, or float seconds")
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(YamlDuration(Duration::from_secs(v)))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v <= 0 {
                    return Err(E::custom("duration must be positive"));
                }
                Ok(YamlDuration(Duration::from_secs(v as u64)))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if !v.is_finite() || v <= 0.0 {
                    return Err(E::custom("duration must be a positive, finite number"));
                }
                Ok(YamlDuration(Duration::from_secs_f64(v)))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                let d = humantime::parse_duration(v).map_err(E::custom)?;
                Ok(YamlDuration(d))
            }

            fn visit_string<E>(self, v: String) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                self.visit_str(&v)
            }
        }

        deserializer.deserialize_any(V)
    }
}

/// A named service configuration the scenario runs against.
#[derive(Debug, Clone)]
pub(crate) struct Configuration {
    pub name: String,
    pub member: MemberOptions,
    pub variables: Vec<(String, Value)>,
}

/// A scenario file after parsing; the scenario tree itself is not validated yet.
#[derive(Debug, Clone)]
pub(crate) struct Benchmark {
    pub scenario: Scenario,
    pub clusters: Vec<usize>,
    pub configurations: Vec<Configuration>,
    pub stage_timeout: Option<Duration>,
    pub reports: Vec<ReportYaml>,
}

pub(crate) async fn load_benchmark(path: &Path) -> anyhow::Result<Benchmark> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read scenario YAML: {}", path.display()))?;

    let fallback_name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(DEFAULT_CONFIGURATION);

    parse_benchmark(&raw, fallback_name)
        .with_context(|| format!("invalid scenario YAML: {}", path.display()))
}

/// `fallback_name` labels the implicit configuration when the file declares none.
pub(crate) fn parse_benchmark(raw: &str, fallback_name: &str) -> anyhow::Result<Benchmark> {
    let doc: BenchmarkYaml = serde_yaml::from_str(raw).context("failed to parse YAML")?;

    let clusters = if doc.clusters.is_empty() {
        vec![1]
    } else {
        doc.clusters.iter().map(ClusterYaml::size).collect()
    };
    if clusters.contains(&0) {
        anyhow::bail!("cluster size must be at least 1");
    }

    let configurations = if doc.configurations.is_empty() {
        vec![Configuration {
            name: fallback_name.to_string(),
            member: MemberOptions::default(),
            variables: Vec::new(),
        }]
    } else {
        doc.configurations
            .into_iter()
            .map(configuration_from_yaml)
            .collect::<anyhow::Result<Vec<_>>>()?
    };

    Ok(Benchmark {
        scenario: Scenario::new(doc.scenario.into_iter().map(node_from_yaml).collect()),
        clusters,
        configurations,
        stage_timeout: doc.defaults.stage_timeout.map(YamlDuration::into_inner),
        reports: doc.reports,
    })
}

fn configuration_from_yaml(cfg: ConfigurationYaml) -> anyhow::Result<Configuration> {
    let ConfigurationYaml {
        name,
        service,
        properties,
    } = cfg;

    let without = service
        .without
        .iter()
        .map(|raw| {
            raw.parse::<Capability>()
                .map_err(|_| anyhow::anyhow!("configuration `{name}`: unknown capability `{raw}`"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(Configuration {
        member: MemberOptions {
            start_delay: service
                .start_delay
                .map(YamlDuration::into_inner)
                .unwrap_or_default(),
            fail_on_start: service.fail_on_start,
            without,
        },
        variables: properties.into_iter().collect(),
        name,
    })
}

fn node_from_yaml(node: NodeYaml) -> ScenarioNode {
    match node {
        NodeYaml::Stage(StageSpecYaml::Name(name)) => StageNode::new(name).into(),
        NodeYaml::Stage(StageSpecYaml::Full(stage)) => ScenarioNode::Stage(StageNode {
            stage: stage.name,
            properties: stage.properties,
            advisory: stage.advisory,
            timeout: stage.timeout,
            slaves: stage.slaves,
        }),
        NodeYaml::Repeat(r) => ScenarioNode::Repeat(RepeatNode {
            name: r.name,
            times: r.times,
            from: r.from,
            to: r.to,
            inc: r.inc,
            body: r.body.into_iter().map(node_from_yaml).collect(),
        }),
        NodeYaml::Scale(s) => ScenarioNode::Scale(ScaleNode {
            from: s.from,
            to: s.to,
            inc: s.inc,
            body: s.body.into_iter().map(node_from_yaml).collect(),
        }),
        NodeYaml::Define(d) => ScenarioNode::Define {
            name: d.name,
            value: d.value,
        },
        NodeYaml::AnalyzeTest(properties) => ScenarioNode::AnalyzeTest { properties },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
clusters: [1, { size: 3 }]
configurations:
  - name: warm
    properties:
      threads: 4
  - name: slow-start
    service:
      startDelay: 50ms
      without: [continuous-query]
defaults:
  stageTimeout: 2m
scenario:
  - stage: service-start
  - define: { name: requests, value: 100 }
  - repeat:
      name: outer
      from: 1
      to: 3
      body:
        - stage:
            name: basic-operations
            testName: load
            numRequests: "${requests}"
            advisory: true
            timeout: 30s
  - scale:
      inc: 2
      body:
        - stage: { name: check-cluster, slaves: [0] }
  - analyzeTest:
      testName: load
      operation: BasicOperations.Put
reports:
  - type: json
    path: out/report.json
"#;

    fn parse(raw: &str) -> Benchmark {
        parse_benchmark(raw, "bench").unwrap_or_else(|e| panic!("{e:#}"))
    }

    #[test]
    fn parses_full_document() {
        let bench = parse(FULL);

        assert_eq!(bench.clusters, vec![1, 3]);
        assert_eq!(bench.stage_timeout, Some(Duration::from_secs(120)));
        assert_eq!(
            bench.reports,
            vec![ReportYaml::Json {
                path: PathBuf::from("out/report.json")
            }]
        );

        assert_eq!(bench.configurations.len(), 2);
        assert_eq!(
            bench.configurations[0].variables,
            vec![("threads".to_string(), Value::I64(4))]
        );
        let slow = &bench.configurations[1].member;
        assert_eq!(slow.start_delay, Duration::from_millis(50));
        assert_eq!(slow.without, vec![Capability::ContinuousQuery]);

        let nodes = &bench.scenario.nodes;
        assert_eq!(nodes.len(), 5);
        assert_eq!(nodes[0], ScenarioNode::from(StageNode::new("service-start")));

        let ScenarioNode::Repeat(repeat) = &nodes[2] else {
            panic!("expected repeat, got {:?}", nodes[2]);
        };
        assert_eq!(repeat.name.as_deref(), Some("outer"));
        assert_eq!(repeat.to, Some(Value::I64(3)));
        let ScenarioNode::Stage(load) = &repeat.body[0] else {
            panic!("expected stage, got {:?}", repeat.body[0]);
        };
        assert!(load.advisory);
        assert_eq!(load.timeout, Some(Value::string("30s")));
        assert_eq!(
            load.properties.get("numRequests"),
            Some(&Value::string("${requests}"))
        );
        assert!(!load.properties.contains_key("advisory"));

        let ScenarioNode::Scale(scale) = &nodes[3] else {
            panic!("expected scale, got {:?}", nodes[3]);
        };
        assert_eq!(scale.inc, Some(Value::I64(2)));
        assert!(matches!(&nodes[4], ScenarioNode::AnalyzeTest { properties } if properties.len() == 2));

        if let Err(errors) = bench.scenario.validate() {
            panic!("unexpected validation errors: {errors:?}");
        }
    }

    #[test]
    fn minimal_document_gets_defaults() {
        let bench = parse("scenario:\n  - stage: sleep\n");
        assert_eq!(bench.clusters, vec![1]);
        assert_eq!(bench.configurations.len(), 1);
        assert_eq!(bench.configurations[0].name, "bench");
        assert_eq!(bench.stage_timeout, None);
        assert!(bench.reports.is_empty());
    }

    #[test]
    fn rejects_invalid_documents() {
        for raw in [
            "clusters: [0]\nscenario: []\n",
            "scenario:\n  - warp: {}\n",
            "configurations:\n  - name: x\n    service: { without: [teleport] }\nscenario: []\n",
            "defaults: { stageTimeout: -1 }\nscenario: []\n",
            "bogus: 1\nscenario: []\n",
        ] {
            assert!(parse_benchmark(raw, "bench").is_err(), "accepted: {raw}");
        }
    }

    #[test]
    fn yaml_duration_accepts_numbers_and_strings() {
        let parse_d = |raw: &str| -> Duration {
            serde_yaml::from_str::<YamlDuration>(raw)
                .unwrap_or_else(|e| panic!("{e:#}"))
                .into_inner()
        };
        assert_eq!(parse_d("5"), Duration::from_secs(5));
        assert_eq!(parse_d("0.5"), Duration::from_millis(500));
        assert_eq!(parse_d("1m 30s"), Duration::from_secs(90));
    }
}

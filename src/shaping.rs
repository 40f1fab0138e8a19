// Traffic shaping: request validation, tcset argument compilation, and
// classification of the tool's diagnostic output

use crate::config::Capability;
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tokio::process::Command;

/// Traffic direction relative to this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client pushes to the server (shape what we receive).
    Incoming,
    /// Client pulls from the server (shape what we send).
    Outgoing,
}

impl Direction {
    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "incoming" => Ok(Direction::Incoming),
            "outgoing" => Ok(Direction::Outgoing),
            "" => bail!("no direction"),
            _ => bail!("invalid direction={raw}"),
        }
    }

    fn flag(&self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }
}

/// What traffic the rule applies to.
///
/// The selector flag depends on the direction: a server port is our source
/// port for outgoing traffic but our destination port for incoming traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identify {
    All,
    ServerPort(String),
    ClientPort(String),
    ClientIp(String),
}

impl Identify {
    fn parse(key: &str, value: Option<&str>) -> Result<Self> {
        if key.is_empty() {
            bail!("no identifyKey");
        }
        if key == "all" {
            return Ok(Identify::All);
        }

        let value = match value {
            Some(v) if !v.is_empty() => v.to_string(),
            _ => bail!("no identifyValue for identifyKey={key}"),
        };
        match key {
            "serverPort" => Ok(Identify::ServerPort(value)),
            "clientPort" => Ok(Identify::ClientPort(value)),
            "clientIp" => Ok(Identify::ClientIp(value)),
            _ => bail!("invalid identifyKey={key}"),
        }
    }
}

/// One impairment with its magnitude and optional jitter.
///
/// Magnitudes stay as the caller's strings; tcset does its own unit parsing
/// and we only attach the unit suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Packet loss in percent.
    Loss { percent: String, distro: Option<String> },
    /// Added latency in milliseconds.
    Delay { ms: String, distro: Option<String> },
    /// Bandwidth cap in kbps.
    Rate { kbps: String, distro: Option<String> },
}

impl Strategy {
    fn kind(&self) -> &'static str {
        match self {
            Strategy::Loss { .. } => "loss",
            Strategy::Delay { .. } => "delay",
            Strategy::Rate { .. } => "rate",
        }
    }

    fn distro(&self) -> Option<&str> {
        match self {
            Strategy::Loss { distro, .. }
            | Strategy::Delay { distro, .. }
            | Strategy::Rate { distro, .. } => distro.as_deref(),
        }
    }

    fn compile_into(&self, args: &mut Vec<String>) {
        match self {
            Strategy::Loss { percent, .. } => {
                args.push("--loss".to_string());
                args.push(format!("{percent}%"));
            }
            Strategy::Delay { ms, .. } => {
                args.push("--delay".to_string());
                args.push(format!("{ms}ms"));
            }
            Strategy::Rate { kbps, .. } => {
                // tc itself is in kbit; tcset takes kbps and converts.
                args.push("--rate".to_string());
                args.push(format!("{kbps}kbps"));
            }
        }
        // The jitter flag follows whichever strategy flag its slot emitted.
        if let Some(distro) = self.distro() {
            args.push("--delay-distro".to_string());
            args.push(distro.to_string());
        }
    }
}

/// Raw query parameters of the setup endpoint, one field per slot exactly as
/// the UI sends them.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SetupParams {
    pub iface: Option<String>,
    pub protocol: Option<String>,
    pub direction: Option<String>,
    #[serde(rename = "identifyKey")]
    pub identify_key: Option<String>,
    #[serde(rename = "identifyValue")]
    pub identify_value: Option<String>,
    pub strategy: Option<String>,
    pub loss: Option<String>,
    pub delay: Option<String>,
    pub rate: Option<String>,
    #[serde(rename = "delayDistro")]
    pub delay_distro: Option<String>,
    pub strategy2: Option<String>,
    pub loss2: Option<String>,
    pub delay2: Option<String>,
    pub rate2: Option<String>,
    #[serde(rename = "delayDistro2")]
    pub delay_distro2: Option<String>,
    /// Per-request override of the management port exclusion.
    pub api: Option<String>,
}

fn slot_strategy(
    name: &str,
    loss: Option<&str>,
    delay: Option<&str>,
    rate: Option<&str>,
    distro: Option<&str>,
) -> Result<Option<Strategy>> {
    let require = |value: Option<&str>, what: &str| -> Result<String> {
        match value {
            Some(v) if !v.is_empty() => Ok(v.to_string()),
            _ => bail!("no {what}"),
        }
    };
    let distro = distro.filter(|v| !v.is_empty()).map(str::to_string);

    match name {
        "" => Ok(None),
        "loss" => Ok(Some(Strategy::Loss {
            percent: require(loss, "loss")?,
            distro,
        })),
        "delay" => Ok(Some(Strategy::Delay {
            ms: require(delay, "delay")?,
            distro,
        })),
        "rate" => Ok(Some(Strategy::Rate {
            kbps: require(rate, "rate")?,
            distro,
        })),
        _ => bail!("invalid strategy={name}"),
    }
}

/// A validated shaping request, ready to compile.
#[derive(Debug, Clone)]
pub struct ShapingRequest {
    pub iface: String,
    pub protocol: String,
    pub direction: Direction,
    pub identify: Identify,
    /// One or two strategies with distinct kinds, in declared order.
    pub strategies: Vec<Strategy>,
    /// The control API's own port, always excluded from shaping.
    pub api_port: String,
}

impl ShapingRequest {
    /// Validate raw parameters. Nothing is executed here; every rejection is
    /// reported before any tool runs.
    pub fn from_params(params: &SetupParams, default_api_port: &str) -> Result<Self> {
        fn text(v: &Option<String>) -> &str {
            v.as_deref().unwrap_or("")
        }

        let iface = text(&params.iface);
        if iface.is_empty() {
            bail!("no iface");
        }
        let protocol = text(&params.protocol);
        if protocol.is_empty() {
            bail!("no protocol");
        }
        let direction = Direction::parse(text(&params.direction))?;
        let identify = Identify::parse(text(&params.identify_key), params.identify_value.as_deref())?;

        let first = slot_strategy(
            text(&params.strategy),
            params.loss.as_deref(),
            params.delay.as_deref(),
            params.rate.as_deref(),
            params.delay_distro.as_deref(),
        )?;
        let second = slot_strategy(
            text(&params.strategy2),
            params.loss2.as_deref(),
            params.delay2.as_deref(),
            params.rate2.as_deref(),
            params.delay_distro2.as_deref(),
        )?;
        if first.is_none() && second.is_none() {
            bail!("no strategy");
        }
        if let (Some(a), Some(b)) = (&first, &second) {
            if a.kind() == b.kind() {
                bail!("duplicated strategy {}", a.kind());
            }
        }
        let strategies = [first, second].into_iter().flatten().collect();

        let api_port = match params.api.as_deref() {
            Some(v) if !v.is_empty() => v.to_string(),
            _ => default_api_port.to_string(),
        };

        Ok(Self {
            iface: iface.to_string(),
            protocol: protocol.to_string(),
            direction,
            identify,
            strategies,
            api_port,
        })
    }

    /// Compile to the ordered tcset argument list. Pure and idempotent; tcset
    /// is sensitive to flag order, so the sequence here is the contract.
    pub fn compile(&self) -> Vec<String> {
        // HTB needs no iptables, so rules work on a bare host.
        let mut args: Vec<String> = vec![
            "--overwrite".to_string(),
            "--shaping-algo".to_string(),
            "htb".to_string(),
        ];

        args.push("--direction".to_string());
        args.push(self.direction.flag().to_string());

        // Never shape the control API's own traffic.
        let (exclude_flag, server_flag, client_port_flag, client_net_flag) = match self.direction {
            Direction::Outgoing => ("--exclude-src-port", "--src-port", "--dst-port", "--dst-network"),
            Direction::Incoming => ("--exclude-dst-port", "--dst-port", "--src-port", "--src-network"),
        };
        args.push(exclude_flag.to_string());
        args.push(self.api_port.clone());

        match &self.identify {
            Identify::All => {}
            Identify::ServerPort(value) => {
                args.push(server_flag.to_string());
                args.push(value.clone());
            }
            Identify::ClientPort(value) => {
                args.push(client_port_flag.to_string());
                args.push(value.clone());
            }
            Identify::ClientIp(value) => {
                args.push(client_net_flag.to_string());
                args.push(value.clone());
            }
        }

        for strategy in &self.strategies {
            strategy.compile_into(&mut args);
        }

        args.push(self.iface.clone());
        args
    }
}

/// Decide whether shaping tool output reports a real failure.
///
/// tcset/tcdel print diagnostics even on logical success. The one benign case
/// is deleting a nonexistent ingress qdisc, which always logs a single ERROR:
///
///     tc qdisc del dev lo ingress
///     Error: Invalid handle.
pub fn classify_tool_output(output: &str) -> Result<()> {
    let nn_errors = output.matches("ERROR").count();
    if nn_errors == 0 {
        return Ok(());
    }

    let is_ingress_del = output.contains("ingress") && output.contains("qdisc del");
    if nn_errors == 1 && is_ingress_del {
        return Ok(());
    }
    bail!("{output}");
}

/// Query result of tcshow for one interface.
#[derive(Debug, serde::Serialize)]
pub struct QueryResult {
    pub cmd: String,
    pub output: String,
}

/// Runs the external tcconfig tools.
///
/// Platform support is a capability decided once at construction; on hosts
/// without shaping the mutating calls are logged no-ops, matching what the
/// UI expects during development.
pub struct TcRunner {
    capability: Capability,
}

impl TcRunner {
    pub fn new(capability: Capability) -> Self {
        Self { capability }
    }

    pub async fn setup(&self, request: &ShapingRequest) -> Result<()> {
        let args = request.compile();
        if !self.capability.shaping {
            log::info!("shaping disabled on this host, skip tcset {}", args.join(" "));
            return Ok(());
        }

        let rendered = format!("tcset {}", args.join(" "));
        let output = Command::new("tcset")
            .args(&args)
            .output()
            .await
            .with_context(|| rendered.clone())?;
        let text = combined_text(&output.stdout, &output.stderr);
        if !output.status.success() {
            bail!("{rendered}: {text}");
        }
        classify_tool_output(&text).with_context(|| rendered.clone())?;
        log::info!("{rendered}, {text}");
        Ok(())
    }

    pub async fn reset(&self, iface: &str) -> Result<()> {
        if iface.is_empty() {
            bail!("no iface");
        }
        if !self.capability.shaping {
            log::info!("shaping disabled on this host, skip tcdel --all {iface}");
            return Ok(());
        }

        let rendered = format!("tcdel --all {iface}");
        let output = Command::new("tcdel")
            .args(["--all", iface])
            .output()
            .await
            .with_context(|| rendered.clone())?;
        let text = combined_text(&output.stdout, &output.stderr);
        if !output.status.success() {
            bail!("{rendered}: {text}");
        }
        classify_tool_output(&text).with_context(|| rendered.clone())?;
        log::info!("{rendered}, {text}");
        Ok(())
    }

    pub async fn query(&self, iface: &str) -> Result<QueryResult> {
        if iface.is_empty() {
            bail!("no iface");
        }
        if !self.capability.shaping {
            return Ok(QueryResult {
                cmd: format!("tcshow {iface}"),
                output: String::new(),
            });
        }

        let rendered = format!("tcshow {iface}");
        let output = Command::new("tcshow")
            .arg(iface)
            .output()
            .await
            .with_context(|| rendered.clone())?;
        if !output.status.success() {
            bail!(
                "{rendered}: {}",
                combined_text(&output.stdout, &output.stderr)
            );
        }

        Ok(QueryResult {
            cmd: rendered,
            output: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        })
    }

    /// Run a whitelisted raw tcconfig command and parse its JSON output when
    /// there is any.
    pub async fn raw(&self, cmdline: &str) -> Result<Option<serde_json::Value>> {
        let args: Vec<&str> = cmdline.split_whitespace().collect();
        let Some((&arg0, rest)) = args.split_first() else {
            bail!("no cmd");
        };
        match arg0 {
            "tcset" | "tcshow" | "tcdel" => {}
            _ => bail!("invalid cmd {cmdline}"),
        }

        let output = Command::new(arg0)
            .args(rest)
            .output()
            .await
            .with_context(|| format!("exec {cmdline}"))?;
        if !output.status.success() {
            bail!(
                "exec {cmdline}: {}",
                combined_text(&output.stdout, &output.stderr)
            );
        }
        if output.stdout.is_empty() {
            log::info!("exec {cmdline} ok");
            return Ok(None);
        }

        let text = String::from_utf8_lossy(&output.stdout);
        log::info!("exec {cmdline} output {text}");
        let value = serde_json::from_str(&text).with_context(|| format!("unmarshal {text}"))?;
        Ok(Some(value))
    }
}

fn combined_text(stdout: &[u8], stderr: &[u8]) -> String {
    let mut text = String::from_utf8_lossy(stdout).to_string();
    text.push_str(&String::from_utf8_lossy(stderr));
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_params() -> SetupParams {
        SetupParams {
            iface: Some("eth0".to_string()),
            protocol: Some("udp".to_string()),
            direction: Some("outgoing".to_string()),
            identify_key: Some("serverPort".to_string()),
            identify_value: Some("8000".to_string()),
            strategy: Some("loss".to_string()),
            loss: Some("5".to_string()),
            ..SetupParams::default()
        }
    }

    #[test]
    fn test_rejects_missing_fields() {
        let mut params = base_params();
        params.iface = None;
        assert!(ShapingRequest::from_params(&params, "2023").is_err());

        let mut params = base_params();
        params.protocol = Some(String::new());
        assert!(ShapingRequest::from_params(&params, "2023").is_err());

        let mut params = base_params();
        params.direction = Some("sideways".to_string());
        assert!(ShapingRequest::from_params(&params, "2023").is_err());

        let mut params = base_params();
        params.identify_key = None;
        assert!(ShapingRequest::from_params(&params, "2023").is_err());

        let mut params = base_params();
        params.identify_key = Some("serverIp".to_string());
        assert!(ShapingRequest::from_params(&params, "2023").is_err());

        let mut params = base_params();
        params.identify_value = None;
        assert!(ShapingRequest::from_params(&params, "2023").is_err());
    }

    #[test]
    fn test_identify_all_needs_no_value() {
        let mut params = base_params();
        params.identify_key = Some("all".to_string());
        params.identify_value = None;
        let request = ShapingRequest::from_params(&params, "2023").unwrap();
        assert_eq!(request.identify, Identify::All);
    }

    #[test]
    fn test_rejects_strategy_problems() {
        // No strategy at all.
        let mut params = base_params();
        params.strategy = None;
        assert!(ShapingRequest::from_params(&params, "2023").is_err());

        // Duplicated kind across the two slots.
        let mut params = base_params();
        params.strategy2 = Some("loss".to_string());
        params.loss2 = Some("10".to_string());
        assert!(ShapingRequest::from_params(&params, "2023").is_err());

        // Unknown strategy name.
        let mut params = base_params();
        params.strategy = Some("jitter".to_string());
        assert!(ShapingRequest::from_params(&params, "2023").is_err());

        // Missing magnitude, checked per slot.
        let mut params = base_params();
        params.loss = None;
        assert!(ShapingRequest::from_params(&params, "2023").is_err());

        let mut params = base_params();
        params.strategy2 = Some("delay".to_string());
        assert!(ShapingRequest::from_params(&params, "2023").is_err());

        let mut params = base_params();
        params.strategy2 = Some("rate".to_string());
        params.rate2 = Some(String::new());
        assert!(ShapingRequest::from_params(&params, "2023").is_err());
    }

    #[test]
    fn test_single_strategy_in_second_slot() {
        let mut params = base_params();
        params.strategy = None;
        params.loss = None;
        params.strategy2 = Some("rate".to_string());
        params.rate2 = Some("500".to_string());
        let request = ShapingRequest::from_params(&params, "2023").unwrap();
        assert_eq!(
            request.strategies,
            vec![Strategy::Rate {
                kbps: "500".to_string(),
                distro: None
            }]
        );
    }

    #[test]
    fn test_compile_outgoing_server_port_loss() {
        let request = ShapingRequest::from_params(&base_params(), "2023").unwrap();
        assert_eq!(
            request.compile(),
            vec![
                "--overwrite",
                "--shaping-algo",
                "htb",
                "--direction",
                "outgoing",
                "--exclude-src-port",
                "2023",
                "--src-port",
                "8000",
                "--loss",
                "5%",
                "eth0",
            ]
        );
    }

    #[test]
    fn test_compile_incoming_selector_mapping() {
        let mut params = base_params();
        params.direction = Some("incoming".to_string());
        let request = ShapingRequest::from_params(&params, "2023").unwrap();
        let args = request.compile();
        // serverPort maps to our destination port for incoming traffic.
        assert!(contains_pair(&args, "--exclude-dst-port", "2023"));
        assert!(contains_pair(&args, "--dst-port", "8000"));

        params.identify_key = Some("clientIp".to_string());
        params.identify_value = Some("192.168.1.0/24".to_string());
        let request = ShapingRequest::from_params(&params, "2023").unwrap();
        assert!(contains_pair(&request.compile(), "--src-network", "192.168.1.0/24"));

        params.identify_key = Some("clientPort".to_string());
        params.identify_value = Some("40000".to_string());
        let request = ShapingRequest::from_params(&params, "2023").unwrap();
        assert!(contains_pair(&request.compile(), "--src-port", "40000"));
    }

    #[test]
    fn test_compile_outgoing_client_selectors() {
        let mut params = base_params();
        params.identify_key = Some("clientIp".to_string());
        params.identify_value = Some("192.168.1.7".to_string());
        let request = ShapingRequest::from_params(&params, "2023").unwrap();
        assert!(contains_pair(&request.compile(), "--dst-network", "192.168.1.7"));

        params.identify_key = Some("clientPort".to_string());
        params.identify_value = Some("40000".to_string());
        let request = ShapingRequest::from_params(&params, "2023").unwrap();
        assert!(contains_pair(&request.compile(), "--dst-port", "40000"));

        params.identify_key = Some("all".to_string());
        params.identify_value = None;
        let request = ShapingRequest::from_params(&params, "2023").unwrap();
        let args = request.compile();
        assert!(!args.iter().any(|a| a == "--src-port" || a == "--dst-port"));
    }

    #[test]
    fn test_compile_two_strategies_in_declared_order() {
        let mut params = base_params();
        params.strategy2 = Some("rate".to_string());
        params.rate2 = Some("500".to_string());
        let request = ShapingRequest::from_params(&params, "2023").unwrap();
        let args = request.compile();
        let loss = args.iter().position(|a| a == "--loss").unwrap();
        let rate = args.iter().position(|a| a == "--rate").unwrap();
        assert!(loss < rate);
        assert_eq!(args[loss + 1], "5%");
        assert_eq!(args[rate + 1], "500kbps");
        assert_eq!(args.last().unwrap(), "eth0");

        let mut params = base_params();
        params.strategy = Some("delay".to_string());
        params.delay = Some("100".to_string());
        params.delay_distro = Some("20".to_string());
        params.strategy2 = Some("rate".to_string());
        params.rate2 = Some("500".to_string());
        let request = ShapingRequest::from_params(&params, "2023").unwrap();
        let args = request.compile();
        let delay = args.iter().position(|a| a == "--delay").unwrap();
        assert_eq!(args[delay + 1], "100ms");
        assert_eq!(args[delay + 2], "--delay-distro");
        assert_eq!(args[delay + 3], "20");
        let rate = args.iter().position(|a| a == "--rate").unwrap();
        assert!(delay < rate);
    }

    #[test]
    fn test_loss_slot_keeps_delay_distro() {
        // The jitter magnitude belongs to the slot, whatever its strategy.
        let mut params = base_params();
        params.delay_distro = Some("20".to_string());
        let request = ShapingRequest::from_params(&params, "2023").unwrap();
        let args = request.compile();
        let loss = args.iter().position(|a| a == "--loss").unwrap();
        assert_eq!(args[loss + 1], "5%");
        assert_eq!(args[loss + 2], "--delay-distro");
        assert_eq!(args[loss + 3], "20");

        // Same for a loss slot in the second position.
        let mut params = base_params();
        params.strategy = Some("rate".to_string());
        params.rate = Some("500".to_string());
        params.loss = None;
        params.strategy2 = Some("loss".to_string());
        params.loss2 = Some("5".to_string());
        params.delay_distro2 = Some("30".to_string());
        let request = ShapingRequest::from_params(&params, "2023").unwrap();
        let args = request.compile();
        let loss = args.iter().position(|a| a == "--loss").unwrap();
        assert_eq!(args[loss + 2], "--delay-distro");
        assert_eq!(args[loss + 3], "30");
    }

    #[test]
    fn test_api_override_replaces_default_port() {
        let mut params = base_params();
        params.api = Some("8080".to_string());
        let request = ShapingRequest::from_params(&params, "2023").unwrap();
        assert!(contains_pair(&request.compile(), "--exclude-src-port", "8080"));
    }

    #[test]
    fn test_compile_is_idempotent() {
        let request = ShapingRequest::from_params(&base_params(), "2023").unwrap();
        assert_eq!(request.compile(), request.compile());
    }

    #[test]
    fn test_classify_tool_output() {
        assert!(classify_tool_output("").is_ok());
        assert!(classify_tool_output("set eth0 qdisc").is_ok());

        // The benign ingress deletion noise.
        let benign = "tc qdisc del dev lo ingress\nERROR: Invalid handle.";
        assert!(classify_tool_output(benign).is_ok());

        // One ERROR without the ingress signature is a real failure.
        assert!(classify_tool_output("ERROR: no such device").is_err());

        // Two ERRORs fail even with the signature present.
        let double = "tc qdisc del dev lo ingress\nERROR: Invalid handle.\nERROR: again";
        assert!(classify_tool_output(double).is_err());

        // Token match is case-sensitive.
        assert!(classify_tool_output("error: lowercase is not the token").is_ok());
    }

    fn contains_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2)
            .any(|pair| pair[0] == flag && pair[1] == value)
    }
}

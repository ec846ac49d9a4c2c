//! # Modem Dialects
//!
//! The three supported modem families speak materially different AT
//! command sets for data-context setup and TCP sockets. Each family gets
//! one static [`Dialect`] table, selected once by [`Modem::resolve_variant`];
//! callers never branch on the variant themselves.
//!
//! Command templates may contain placeholders filled from the
//! [`RadioProfile`]: `{apn}`, `{bands}`, `{dns1}` and `{dns2}`.

use super::{CommandLine, Modem};
use crate::board::{Clock, PowerKey, Watchdog};
use crate::serial::SerialLink;
use tracing::{debug, info, warn};

/// Supported modem families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModemVariant {
    /// SIMCom SIM7000G (also the fallback when identification fails)
    #[default]
    Sim7000,
    /// SIMCom A7670E
    A7670,
    /// SIMCom SIM7070G
    Sim7070,
}

impl ModemVariant {
    /// Classify an `AT+CGMM` reply
    pub fn from_identification(reply: &str) -> Option<Self> {
        if reply.contains("A7670") {
            Some(ModemVariant::A7670)
        } else if reply.contains("SIM7070") {
            Some(ModemVariant::Sim7070)
        } else if reply.contains("SIM7000") {
            Some(ModemVariant::Sim7000)
        } else {
            None
        }
    }

    pub fn dialect(self) -> &'static Dialect {
        match self {
            ModemVariant::Sim7000 => &SIM7000,
            ModemVariant::A7670 => &A7670,
            ModemVariant::Sim7070 => &SIM7070,
        }
    }
}

impl std::fmt::Display for ModemVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dialect().model)
    }
}

/// One command of a scripted procedure
#[derive(Debug, Clone, Copy)]
pub struct AtStep {
    /// Command template
    pub command: &'static str,
    /// Any of these in the reply counts as success
    pub expect: &'static [&'static str],
    pub timeout_ms: u64,
    pub retries: u8,
    /// A failed required step aborts the procedure
    pub required: bool,
}

const fn step(command: &'static str, expect: &'static [&'static str], timeout_ms: u64, retries: u8) -> AtStep {
    AtStep {
        command,
        expect,
        timeout_ms,
        retries,
        required: true,
    }
}

const fn best_effort(command: &'static str, expect: &'static [&'static str], timeout_ms: u64, retries: u8) -> AtStep {
    AtStep {
        command,
        expect,
        timeout_ms,
        retries,
        required: false,
    }
}

const OK: &[&str] = &["OK"];

/// Per-family command vocabulary
#[derive(Debug)]
pub struct Dialect {
    pub model: &'static str,
    /// Unsolicited-report, time-sync and band setup specific to the family
    pub radio_setup: &'static [AtStep],
    /// Technology preference selection
    pub technology: &'static [AtStep],
    /// APN configuration plus the family's IP stack bring-up
    pub data_open: &'static [AtStep],
    /// Data-context teardown
    pub data_close: &'static [AtStep],
    /// Socket open command up to and including the comma before the host
    pub tcp_open_prefix: &'static str,
    /// Connect confirmation
    pub tcp_open_ok: &'static str,
    pub tcp_open_timeout_ms: u64,
    /// Family first answers a bare `OK` and confirms the connect later
    pub tcp_open_tentative_ok: bool,
    /// Send command up to the payload length
    pub tcp_send_prefix: &'static str,
    pub send_prompt: &'static str,
    /// Either completion reply accepts the send
    pub send_ok: [&'static str; 2],
    pub tcp_close: &'static str,
    pub tcp_close_ok: &'static str,
    /// Fallback when the graceful close is not confirmed
    pub force_close: Option<AtStep>,
    pub gnss_on: AtStep,
    pub gnss_off: AtStep,
}

pub static SIM7000: Dialect = Dialect {
    model: "SIM7000G",
    radio_setup: &[
        best_effort("AT+CGNSURC=0", OK, 1000, 2),
        best_effort("AT+CGNSTST=0", OK, 1000, 2),
        best_effort("AT+CLTS=0", OK, 1000, 2),
        best_effort("AT+CBANDCFG=\"CAT-M\",{bands}", OK, 2000, 2),
    ],
    technology: &[step("AT+CNMP=38", OK, 500, 3), step("AT+CMNB=1", OK, 500, 3)],
    data_open: &[
        step("AT+CIPSHUT", &["SHUT OK"], 3000, 2),
        step("AT+CIPMUX=0", OK, 1000, 2),
        step("AT+CIPRXGET=1", OK, 1000, 2),
        step("AT+CSTT=\"{apn}\",\"\",\"\"", OK, 1000, 2),
        step("AT+CIICR", OK, 5000, 2),
        // Any dotted address means the bearer is up
        step("AT+CIFSR", &["."], 3000, 2),
    ],
    data_close: &[step("AT+CIPSHUT", &["SHUT OK"], 3000, 2)],
    tcp_open_prefix: "AT+CIPSTART=\"TCP\",",
    tcp_open_ok: "CONNECT OK",
    tcp_open_timeout_ms: 10_000,
    tcp_open_tentative_ok: true,
    tcp_send_prefix: "AT+CIPSEND=",
    send_prompt: ">",
    send_ok: ["SEND OK", "+CIPSEND:"],
    tcp_close: "AT+CIPCLOSE",
    tcp_close_ok: "CLOSE OK",
    force_close: Some(step("AT+CIPSHUT", &["SHUT OK"], 3000, 2)),
    gnss_on: step("AT+CGNSPWR=1", OK, 500, 3),
    gnss_off: step("AT+CGNSPWR=0", OK, 500, 3),
};

pub static A7670: Dialect = Dialect {
    model: "A7670E",
    radio_setup: &[],
    technology: &[step("AT+CNMP=38", OK, 500, 3)],
    data_open: &[
        step("AT+CGDCONT=1,\"IP\",\"{apn}\",\"0.0.0.0\",0,0", OK, 1000, 3),
        step("AT+NETOPEN", &["+NETOPEN: 0", "already opened"], 20_000, 3),
        best_effort("AT+CDNSCFG=\"{dns1}\",\"{dns2}\"", OK, 1000, 2),
    ],
    data_close: &[step("AT+NETCLOSE", &["+NETCLOSE:"], 3000, 2)],
    tcp_open_prefix: "AT+CIPOPEN=0,\"TCP\",",
    tcp_open_ok: "+CIPOPEN: 0,0",
    tcp_open_timeout_ms: 30_000,
    tcp_open_tentative_ok: false,
    tcp_send_prefix: "AT+CIPSEND=0,",
    send_prompt: ">",
    send_ok: ["SEND OK", "+CIPSEND:"],
    tcp_close: "AT+CIPCLOSE=0",
    tcp_close_ok: "+CIPCLOSE: 0",
    force_close: None,
    gnss_on: step("AT+CGNSSPWR=1", OK, 1000, 3),
    gnss_off: step("AT+CGNSSPWR=0", OK, 1000, 3),
};

pub static SIM7070: Dialect = Dialect {
    model: "SIM7070G",
    radio_setup: &[best_effort("AT+CBANDCFG=\"CAT-M\",{bands}", OK, 2000, 2)],
    technology: &[step("AT+CNMP=38", OK, 500, 3), step("AT+CMNB=1", OK, 500, 3)],
    data_open: &[
        step("AT+CGDCONT=1,\"IP\",\"{apn}\"", OK, 500, 3),
        step("AT+CNACT=0,1", &["ACTIVE"], 8000, 2),
    ],
    data_close: &[
        best_effort("AT+CACLOSE=0", OK, 2000, 1),
        best_effort("AT+CNACT=0,0", OK, 3000, 1),
    ],
    tcp_open_prefix: "AT+CAOPEN=0,0,\"TCP\",",
    tcp_open_ok: "+CAOPEN: 0,0",
    tcp_open_timeout_ms: 15_000,
    tcp_open_tentative_ok: false,
    tcp_send_prefix: "AT+CASEND=0,",
    send_prompt: ">",
    send_ok: ["OK", "+CASEND: 0,0"],
    tcp_close: "AT+CACLOSE=0",
    tcp_close_ok: "OK",
    force_close: Some(step("AT+CACLOSE=0", OK, 2000, 2)),
    gnss_on: step("AT+CGNSPWR=1", OK, 500, 3),
    gnss_off: step("AT+CGNSPWR=0", OK, 500, 3),
};

/// Operator and band parameters substituted into command templates
#[derive(Debug, Clone, PartialEq)]
pub struct RadioProfile {
    pub apn: String,
    /// CAT-M band list for the SIM7000
    pub cat_m_bands: String,
    /// CAT-M band list for the SIM7070
    pub sim7070_bands: String,
    pub dns_primary: String,
    pub dns_secondary: String,
}

impl Default for RadioProfile {
    fn default() -> Self {
        Self {
            apn: "onomondo".to_string(),
            cat_m_bands: "1,2,3,4,5,8,12,13,18,19,20,26,28,39".to_string(),
            sim7070_bands: "1,2,3,4,5,8,12,13,18,19,20,25,26,28,66,71,85".to_string(),
            dns_primary: "8.8.8.8".to_string(),
            dns_secondary: "1.1.1.1".to_string(),
        }
    }
}

impl RadioProfile {
    fn lookup(&self, key: &str, variant: ModemVariant) -> Option<&str> {
        match key {
            "apn" => Some(&self.apn),
            "bands" if variant == ModemVariant::Sim7070 => Some(&self.sim7070_bands),
            "bands" => Some(&self.cat_m_bands),
            "dns1" => Some(&self.dns_primary),
            "dns2" => Some(&self.dns_secondary),
            _ => None,
        }
    }

    /// Fill the placeholders of `template`.
    ///
    /// Returns `None` for an unknown placeholder, an unterminated brace or a
    /// line longer than [`super::COMMAND_CAPACITY`].
    pub fn expand(&self, template: &str, variant: ModemVariant) -> Option<CommandLine> {
        let mut out = CommandLine::new();
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]).ok()?;
            let close = open + rest[open..].find('}')?;
            out.push_str(self.lookup(&rest[open + 1..close], variant)?).ok()?;
            rest = &rest[close + 1..];
        }
        out.push_str(rest).ok()?;
        Some(out)
    }
}

impl<S, C, W, P> Modem<S, C, W, P>
where
    S: SerialLink,
    C: Clock,
    W: Watchdog,
    P: PowerKey,
{
    /// Identify the modem once after power sequencing.
    ///
    /// Later calls keep the first result; an unrecognised reply keeps the
    /// SIM7000 default.
    pub fn resolve_variant(&mut self) -> ModemVariant {
        if self.resolved {
            warn!("Modem model already resolved as {}; ignoring re-detection", self.variant);
            return self.variant;
        }

        self.clear_input();
        self.write_line("AT+CGMM");
        self.read_response(2000);
        debug!("CGMM raw: {:?}", self.buffer.text());

        match ModemVariant::from_identification(self.buffer.text()) {
            Some(variant) => self.variant = variant,
            None => warn!("Unrecognised modem model, assuming {}", self.variant),
        }
        self.resolved = true;
        info!("Modem detected: {}", self.variant);
        self.variant
    }

    /// Run one command of a table
    pub fn run_step(&mut self, step: &AtStep, profile: &RadioProfile) -> bool {
        let Some(command) = profile.expand(step.command, self.variant) else {
            warn!("Cannot build command from template {}", step.command);
            return false;
        };
        self.send_command_any(&command, step.expect, step.timeout_ms, step.retries)
    }

    /// Run a table in order; a failed required step stops it
    pub fn run_steps(&mut self, steps: &[AtStep], profile: &RadioProfile) -> bool {
        for step in steps {
            if !self.run_step(step, profile) {
                if step.required {
                    warn!("Required step {} failed", step.command);
                    return false;
                }
                debug!("Best-effort step {} failed, continuing", step.command);
            }
        }
        true
    }

    /// Configure the APN and bring up the IP stack of the resolved family
    pub fn open_data_stack(&mut self, profile: &RadioProfile) -> bool {
        let steps = self.dialect().data_open;
        let ok = self.run_steps(steps, profile);
        if ok {
            info!("Data context active ({})", self.variant);
        } else {
            warn!("Data context activation failed ({})", self.variant);
        }
        ok
    }

    pub fn close_data_stack(&mut self, profile: &RadioProfile) -> bool {
        let steps = self.dialect().data_close;
        self.run_steps(steps, profile)
    }

    /// Switch the integrated GNSS engine on or off
    pub fn set_gnss_power(&mut self, on: bool, profile: &RadioProfile) -> bool {
        let dialect = self.dialect();
        let step = if on { &dialect.gnss_on } else { &dialect.gnss_off };
        let ok = self.run_step(step, profile);
        if !ok {
            warn!("GNSS power {} failed on {}", if on { "on" } else { "off" }, self.variant);
        } else if on {
            // Engine needs a moment before the first fix query
            self.pause(1000);
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modem::mocks::*;

    #[test]
    fn test_identification_classification() {
        assert_eq!(ModemVariant::from_identification("A7670E-LASE"), Some(ModemVariant::A7670));
        assert_eq!(ModemVariant::from_identification("SIMCOM_SIM7070"), Some(ModemVariant::Sim7070));
        assert_eq!(ModemVariant::from_identification("SIMCOM_SIM7000G"), Some(ModemVariant::Sim7000));
        assert_eq!(ModemVariant::from_identification("QUECTEL BG96"), None);
    }

    #[test]
    fn test_resolver_defaults_on_unknown_reply() {
        let (mut modem, rig) = sim_modem();
        rig.script.respond("AT+CGMM", "BG96\r\nOK\r\n");
        assert_eq!(modem.resolve_variant(), ModemVariant::Sim7000);
    }

    #[test]
    fn test_resolver_runs_once() {
        let (mut modem, rig) = resolved_modem(ModemVariant::A7670);
        rig.script.respond("AT+CGMM", "SIMCOM_SIM7070\r\nOK\r\n");
        assert_eq!(modem.resolve_variant(), ModemVariant::A7670);
        assert_eq!(rig.script.count("AT+CGMM"), 1);
    }

    #[test]
    fn test_expand_placeholders() {
        let profile = RadioProfile::default();
        let line = profile
            .expand("AT+CSTT=\"{apn}\",\"\",\"\"", ModemVariant::Sim7000)
            .unwrap();
        assert_eq!(line.as_str(), "AT+CSTT=\"onomondo\",\"\",\"\"");

        let bands = profile
            .expand("AT+CBANDCFG=\"CAT-M\",{bands}", ModemVariant::Sim7070)
            .unwrap();
        assert!(bands.ends_with(",66,71,85"));

        assert!(profile.expand("AT{nope}", ModemVariant::Sim7000).is_none());
        assert!(profile.expand("AT{apn", ModemVariant::Sim7000).is_none());
    }

    #[test]
    fn test_every_dialect_expands() {
        let profile = RadioProfile::default();
        for variant in [ModemVariant::Sim7000, ModemVariant::A7670, ModemVariant::Sim7070] {
            let d = variant.dialect();
            for s in d
                .radio_setup
                .iter()
                .chain(d.technology)
                .chain(d.data_open)
                .chain(d.data_close)
            {
                assert!(profile.expand(s.command, variant).is_some(), "{}", s.command);
            }
        }
    }

    #[test]
    fn test_open_data_stack_sim7000() {
        let (mut modem, rig) = resolved_modem(ModemVariant::Sim7000);
        rig.script.respond("AT", "OK\r\n");
        rig.script.respond("AT+CIPSHUT", "SHUT OK\r\n");
        rig.script.respond("AT+CIFSR", "\r\n10.170.3.4\r\n");
        assert!(modem.open_data_stack(&RadioProfile::default()));
        assert_eq!(rig.script.count("AT+CSTT=\"onomondo\""), 1);
        assert_eq!(rig.script.count("AT+CIICR"), 1);
    }

    #[test]
    fn test_open_data_stack_a7670_accepts_already_opened() {
        let (mut modem, rig) = resolved_modem(ModemVariant::A7670);
        rig.script.respond("AT", "OK\r\n");
        rig.script
            .respond("AT+NETOPEN", "+IP ERROR: Network is already opened\r\n");
        assert!(modem.open_data_stack(&RadioProfile::default()));
        assert_eq!(rig.script.count("AT+CDNSCFG"), 1);
    }

    #[test]
    fn test_open_data_stack_sim7070_requires_active() {
        let (mut modem, rig) = resolved_modem(ModemVariant::Sim7070);
        rig.script.respond("AT", "OK\r\n");
        rig.script.respond("AT+CNACT=0,1", "ERROR\r\n");
        assert!(!modem.open_data_stack(&RadioProfile::default()));
        assert_eq!(rig.script.count("AT+CNACT=0,1"), 2);
    }

    #[test]
    fn test_close_data_stack_sim7070_is_best_effort() {
        let (mut modem, rig) = resolved_modem(ModemVariant::Sim7070);
        rig.script.respond("AT", "ERROR\r\n");
        assert!(modem.close_data_stack(&RadioProfile::default()));
    }

    #[test]
    fn test_gnss_power_uses_family_command() {
        let (mut modem, rig) = resolved_modem(ModemVariant::A7670);
        rig.script.respond("AT", "OK\r\n");
        assert!(modem.set_gnss_power(true, &RadioProfile::default()));
        assert_eq!(rig.script.count("AT+CGNSSPWR=1"), 1);
        assert_eq!(rig.script.count("AT+CGNSPWR"), 0);
    }
}

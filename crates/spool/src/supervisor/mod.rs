//! Command map and dispatcher: binds (device class, command name) to a
//! handler, splits incoming statements into name/query/args and always
//! produces a reply string.

mod build;
mod config;
mod split;
mod transfers;

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::{DeviceClass, Reply, Runtime};

pub(crate) type Rt = Arc<Mutex<Runtime>>;
type Handler = fn(&Rt, &str, bool, &[&str]) -> Reply;

enum Lookup {
    Found(Handler),
    WrongClass,
    Unknown,
}

/// Owns the runtime and answers command statements. One supervisor per
/// device.
pub struct Supervisor {
    rt: Rt,
}

impl Supervisor {
    pub fn new(rt: Runtime) -> Self {
        Supervisor { rt: Arc::new(Mutex::new(rt)) }
    }

    /// Shared handle for guards and embedders (the daemon's signal path).
    pub fn runtime(&self) -> Rt {
        Arc::clone(&self.rt)
    }

    /// Process one line of `;`-separated statements, yielding the
    /// concatenated replies.
    pub fn process_line(&self, line: &str) -> String {
        line.split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|stmt| self.dispatch(stmt).to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// One `name?args` or `name=args` statement.
    pub fn dispatch(&self, stmt: &str) -> Reply {
        let Some(at) = stmt.find(['?', '=']) else {
            return Reply::bad_arg(stmt.trim(), false, "neither query nor command");
        };
        let name = stmt[..at].trim();
        let query = stmt.as_bytes()[at] == b'?';
        let rest = stmt[at + 1..].trim();
        let args: Vec<&str> =
            if rest.is_empty() { Vec::new() } else { rest.split(':').map(str::trim).collect() };

        let class = self.rt.lock().unwrap().class;
        debug!(name, query, ?args, "dispatch");
        match lookup(class, name) {
            Lookup::Found(handler) => handler(&self.rt, name, query, &args),
            Lookup::WrongClass => Reply::wrong_class(name, query),
            Lookup::Unknown => Reply::bad_arg(name, query, "unknown command"),
        }
    }
}

/// The command map. Sampler-input transfers only exist on boxes with a
/// sampler (5A and the DIM personality); output-board transfers only where
/// there is an output path (5A and DOM). The generic host runs everything
/// against the modelled device.
fn lookup(class: DeviceClass, name: &str) -> Lookup {
    use config::*;
    use split::split_family;
    use transfers::*;

    let needs_input = matches!(name, "in2net" | "in2disk" | "in2fork" | "in2file" | "in2mem" | "in2memfork" | "fill2out" | "spin2net" | "spin2file");
    let needs_output = matches!(name, "disk2out" | "net2out" | "fill2out");
    let has_input = matches!(class, DeviceClass::Mk5A | DeviceClass::Mk5BDim | DeviceClass::Generic);
    let has_output = matches!(class, DeviceClass::Mk5A | DeviceClass::Mk5BDom | DeviceClass::Generic);

    let handler: Handler = match name {
        "mode" => mode_cmd,
        "net_protocol" => net_protocol_cmd,
        "mtu" => mtu_cmd,
        "ipd" => ipd_cmd,
        "ack" => ack_cmd,
        "constraints" => constraints_query,
        "tstat" => tstat_cmd,
        "evlbi" => evlbi_query,
        "trackmask" => trackmask_cmd,
        "protect" => protect_cmd,
        "reset" => reset_cmd,
        "position" => position_query,
        "scan_set" => scan_set_cmd,
        "vsn" => vsn_cmd,
        "status" => status_query,

        "fill2file" | "fill2net" | "fill2out" => fill_family,
        "disk2net" | "file2net" | "disk2file" | "file2disk" | "file2check" | "file2mem"
        | "disk2out" => disk_family,
        "net2out" | "net2disk" | "net2fork" | "net2file" | "net2check" | "net2sfxc"
        | "net2sfxcfork" | "net2mem" => net_family,
        "in2net" | "in2disk" | "in2fork" | "in2file" | "in2mem" | "in2memfork" => in_family,
        "mem2net" | "mem2file" | "mem2sfxc" | "mem2time" => mem_family,
        "spill2net" | "spill2file" | "spid2net" | "spid2file" | "spif2net" | "spif2file"
        | "spin2net" | "spin2file" | "splet2net" | "splet2file" => split_family,
        "condition" => condition_cmd,
        _ => return Lookup::Unknown,
    };

    if (needs_input && !has_input) || (needs_output && !has_output) {
        return Lookup::WrongClass;
    }
    Lookup::Found(handler)
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use crate::{RamPack, Runtime};

    use super::*;

    fn generic() -> Supervisor {
        Supervisor::new(Runtime::new(DeviceClass::Generic, Arc::new(RamPack::default())))
    }

    #[test]
    fn statements_split_on_semicolons() {
        let sup = generic();
        let out = sup.process_line("protect=off ; position? ;");
        assert!(out.contains("!protect= 0"));
        assert!(out.contains("!position? 0 : 0 : 0"));
    }

    #[test]
    fn unknown_commands_get_code_8() {
        let sup = generic();
        assert!(sup.process_line("warp9=engage;").contains("!warp9= 8"));
        assert!(sup.process_line("nonsense").contains("8"));
    }

    #[test]
    fn class_gating_yields_code_2() {
        let dom = Supervisor::new(Runtime::new(
            DeviceClass::Mk5BDom,
            Arc::new(RamPack::default()),
        ));
        let out = dom.process_line("in2net=connect:localhost;");
        assert!(out.contains("!in2net= 2"), "got: {out}");
        // but replay is its business
        let out = dom.process_line("disk2out?;");
        assert!(out.contains("!disk2out? 0"), "got: {out}");
    }
}

//! Shell commands
//!
//! Each method formats one command line and runs it through
//! [`Client::execute`] with the client's command timeout. The inspection
//! commands additionally parse their report and print what failed.

use std::collections::BTreeMap;

use super::reports::{self, NO_TIMING_PATHS};
use super::{Client, Result, Transport};

/// Tcl list literal: `{a b c}`
fn tcl_list(items: &[String]) -> String {
    format!("{{{}}}", items.join(" "))
}

impl<T: Transport> Client<T> {
    fn run(&mut self, command: &str) -> Result<String> {
        let timeout = self.command_timeout();
        self.execute(command, timeout)
    }

    pub fn change_directory(&mut self, path: &str) -> Result<String> {
        self.run(&format!("cd {}", path))
    }

    pub fn set_part(&mut self, part: &str) -> Result<String> {
        self.run(&format!("set_part {}", part))
    }

    pub fn read_xdc(&mut self, constraints: &[String]) -> Result<String> {
        self.run(&format!("read_xdc {}", tcl_list(constraints)))
    }

    pub fn read_verilog(&mut self, files: &[String], system_verilog: bool) -> Result<String> {
        let flag = if system_verilog { " -sv" } else { "" };
        self.run(&format!("read_verilog{} {}", flag, tcl_list(files)))
    }

    pub fn source_tcl(&mut self, files: &[String]) -> Result<String> {
        self.run(&format!("source {}", tcl_list(files)))
    }

    pub fn synth_design(&mut self, top: &str, part: &str) -> Result<String> {
        self.run(&format!("synth_design -top {} -part {}", top, part))
    }

    pub fn close_project(&mut self) -> Result<String> {
        self.run("close_project")
    }

    pub fn write_checkpoint(&mut self, filename: &str) -> Result<String> {
        self.run(&format!("write_checkpoint -force {}", filename))
    }

    pub fn read_checkpoint(&mut self, filename: &str) -> Result<String> {
        self.run(&format!("read_checkpoint {}", filename))
    }

    pub fn link_design(&mut self) -> Result<String> {
        self.run("link_design")
    }

    pub fn opt_design(&mut self) -> Result<String> {
        self.run("opt_design")
    }

    pub fn place_design(&mut self) -> Result<String> {
        self.run("place_design -no_timing_driven")
    }

    pub fn phys_opt_design(&mut self) -> Result<String> {
        self.run("phys_opt_design")
    }

    pub fn route_design(&mut self) -> Result<String> {
        self.run("route_design")
    }

    pub fn write_bitstream(&mut self, filename: &str) -> Result<String> {
        self.run(&format!("write_bitstream -force {}", filename))
    }

    pub fn open_hw_manager(&mut self) -> Result<String> {
        self.run("open_hw_manager")
    }

    pub fn close_hw_manager(&mut self) -> Result<String> {
        self.run("close_hw_manager")
    }

    pub fn connect_hw_server(&mut self) -> Result<String> {
        self.run("connect_hw_server")
    }

    pub fn open_hw_target(&mut self) -> Result<String> {
        self.run("open_hw_target")
    }

    /// `set_property -dict {K V ...} [objects]`, keys in sorted order
    pub fn set_property(&mut self, props: &BTreeMap<String, String>, objects: &str) -> Result<String> {
        let dict = props
            .iter()
            .map(|(key, val)| format!("{} {}", key, val))
            .collect::<Vec<_>>()
            .join(" ");
        self.run(&format!("set_property -dict {{{}}} [{}]", dict, objects))
    }

    pub fn program_hw_devices(&mut self) -> Result<String> {
        self.run("program_hw_devices [current_hw_device]")
    }

    /// Convert a bitstream into a configuration memory image (`size` in MB)
    pub fn write_cfgmem(
        &mut self,
        input_file: &str,
        output_file: &str,
        size: u32,
        interface: &str,
    ) -> Result<String> {
        self.run(&format!(
            "write_cfgmem -format bin -size {} -interface {} -loadbit {{up 0x00000000 {}}} -force -file {}",
            size, interface, input_file, output_file
        ))
    }

    pub fn create_hw_cfgmem(&mut self, memory: &str) -> Result<String> {
        self.run(&format!("create_hw_cfgmem -hw_device [current_hw_device] {}", memory))
    }

    pub fn program_hw_cfgmem(&mut self) -> Result<String> {
        self.run("program_hw_cfgmem [current_hw_cfgmem]")
    }

    pub fn create_hw_bitstream(&mut self, filename: &str) -> Result<String> {
        self.run(&format!("create_hw_bitstream -hw_device [current_hw_device] {}", filename))
    }

    pub fn boot_hw_device(&mut self) -> Result<String> {
        self.run("boot_hw_device [current_hw_device]")
    }

    /// Run `check_timing`; false if any check reports failing endpoints
    pub fn check_timing(&mut self) -> Result<bool> {
        let body = self.run("check_timing")?;
        let report = reports::parse_timing_checks(&body)?;

        if !report.passed() {
            let console = self.console();
            console.error("\nCheck timing produced errors:\n\n");
            for check in report.failures() {
                tracing::info!("Failing timing check: {}", check.title);
                console.error(&check.text);
            }
        }
        Ok(report.passed())
    }

    pub fn report_drc(&mut self) -> Result<bool> {
        let body = self.run(
            "report_drc -no_waivers -upgrade_cw -ruledecks {default opt_checks placer_checks \
             router_checks bitstream_checks incr_eco_checks eco_checks abs_checks}",
        )?;
        self.surface_violations("DRC", &body)
    }

    pub fn report_methodology(&mut self) -> Result<bool> {
        let body = self.run("report_methodology -no_waivers -checks [get_methodology_checks]")?;
        self.surface_violations("Methodology", &body)
    }

    fn surface_violations(&mut self, name: &str, body: &str) -> Result<bool> {
        let report = reports::parse_violation_report(name, body)?;

        if !report.passed() {
            let console = self.console();
            console.error(&format!(
                "\nReport {} produced {} errors:\n\n",
                report.name, report.violations
            ));
            for section in report.display_sections() {
                console.error(section);
            }
        }
        Ok(report.passed())
    }

    /// Run `report_timing` for negative slack; true if nothing violates
    pub fn report_timing(&mut self) -> Result<bool> {
        let body = self.run("report_timing -delay_type min_max -max_paths 1 -slack_less_than 0")?;
        let report = reports::parse_timing_slack(&body);

        if !report.passed {
            tracing::info!(
                "report_timing did not print '{}' ({} report parts)",
                NO_TIMING_PATHS,
                report.parts
            );
            let console = self.console();
            console.error("\nReport timing produced errors:\n\n");
            console.error(&report.detail);
        }
        Ok(report.passed)
    }
}

//! Sub-command flows
//!
//! Each flow is a fixed sequence of shell commands. Any failing command
//! aborts the flow with its error.

use std::collections::BTreeMap;

use crate::cli::{
    BitstreamArgs, CfgMemArgs, Commands, CommonArgs, FlashArgs, LoadArgs, SynthArgs,
    TransformArgs,
};
use crate::client::{Client, ClientError, Result, Transport};

/// Object the flash properties are applied to
const HW_CFGMEM: &str = "current_hw_cfgmem";

/// Helper bitstream Vivado ships for programming configuration memory
const CFGMEM_HELPER_BITFILE: &str = "[get_property PROGRAM.HW_CFGMEM_BITFILE [current_hw_device]]";

/// Run the flow for `command`. `serve` has no flow and is a no-op here.
pub fn dispatch<T: Transport>(client: &mut Client<T>, command: &Commands) -> Result<()> {
    match command {
        Commands::Serve(_) => Ok(()),
        Commands::Synth(args) => synthesize(client, args),
        Commands::Place(args) => place(client, args),
        Commands::Route(args) => route(client, args),
        Commands::Bitstream(args) => bitstream(client, args),
        Commands::CfgMem(args) => cfg_mem(client, args),
        Commands::Load(args) => load(client, args),
        Commands::Flash(args) => flash(client, args),
        Commands::Check(args) => check(client, args),
    }
}

/// Fresh in-memory project with part, constraints and user scripts
pub fn preamble<T: Transport>(client: &mut Client<T>, common: &CommonArgs) -> Result<()> {
    client.close_project()?;
    client.set_part(&common.part)?;

    if !common.constraint.is_empty() {
        client.read_xdc(&common.constraint)?;
    }
    if !common.tcl.is_empty() {
        client.source_tcl(&common.tcl)?;
    }
    Ok(())
}

pub fn synthesize<T: Transport>(client: &mut Client<T>, args: &SynthArgs) -> Result<()> {
    preamble(client, &args.common)?;

    let system_verilog = args.verilog.iter().any(|f| f.ends_with(".sv"));
    client.read_verilog(&args.verilog, system_verilog)?;
    client.synth_design(&args.top, &args.common.part)?;

    client.write_checkpoint(&args.output.to_string_lossy())?;
    Ok(())
}

/// Preamble then load and link the input checkpoint
fn open_checkpoint<T: Transport>(client: &mut Client<T>, common: &CommonArgs, input: &str) -> Result<()> {
    preamble(client, common)?;
    client.read_checkpoint(input)?;
    client.link_design()?;
    Ok(())
}

pub fn place<T: Transport>(client: &mut Client<T>, args: &TransformArgs) -> Result<()> {
    open_checkpoint(client, &args.common, &args.input)?;
    client.opt_design()?;
    client.place_design()?;
    client.phys_opt_design()?;

    client.write_checkpoint(&args.output.to_string_lossy())?;
    Ok(())
}

pub fn route<T: Transport>(client: &mut Client<T>, args: &TransformArgs) -> Result<()> {
    open_checkpoint(client, &args.common, &args.input)?;
    client.route_design()?;

    client.write_checkpoint(&args.output.to_string_lossy())?;
    Ok(())
}

pub fn bitstream<T: Transport>(client: &mut Client<T>, args: &BitstreamArgs) -> Result<()> {
    let io = &args.transform;
    open_checkpoint(client, &io.common, &io.input)?;
    client.write_bitstream(&io.output.to_string_lossy())?;

    if args.check {
        require_checks(client)?;
    }
    Ok(())
}

pub fn load<T: Transport>(client: &mut Client<T>, args: &LoadArgs) -> Result<()> {
    preamble(client, &args.common)?;

    open_target(client)?;
    let props = BTreeMap::from([("PROGRAM.FILE".to_string(), args.input.clone())]);
    client.set_property(&props, "current_hw_device")?;
    client.program_hw_devices()?;
    client.close_hw_manager()?;
    Ok(())
}

pub fn cfg_mem<T: Transport>(client: &mut Client<T>, args: &CfgMemArgs) -> Result<()> {
    let io = &args.transform;
    preamble(client, &io.common)?;
    client.write_cfgmem(
        &io.input,
        &io.output.to_string_lossy(),
        args.size,
        &args.interface.to_string(),
    )?;
    Ok(())
}

pub fn flash<T: Transport>(client: &mut Client<T>, args: &FlashArgs) -> Result<()> {
    preamble(client, &args.load.common)?;

    open_target(client)?;
    client.create_hw_cfgmem(&args.memory)?;
    client.set_property(&flash_properties(&args.load.input), HW_CFGMEM)?;

    // The device must run the helper design before the memory can be written.
    client.create_hw_bitstream(CFGMEM_HELPER_BITFILE)?;
    client.program_hw_devices()?;

    client.program_hw_cfgmem()?;
    client.boot_hw_device()?;

    client.close_hw_manager()?;
    Ok(())
}

pub fn check<T: Transport>(client: &mut Client<T>, args: &LoadArgs) -> Result<()> {
    open_checkpoint(client, &args.common, &args.input)?;
    require_checks(client)
}

fn open_target<T: Transport>(client: &mut Client<T>) -> Result<()> {
    client.open_hw_manager()?;
    client.connect_hw_server()?;
    client.open_hw_target()?;
    Ok(())
}

fn flash_properties(input: &str) -> BTreeMap<String, String> {
    [
        ("PROGRAM.FILES", input),
        ("PROGRAM.ADDRESS_RANGE", "use_file"),
        ("PROGRAM.ERASE", "1"),
        ("PROGRAM.BLANK_CHECK", "0"),
        ("PROGRAM.CFG_PROGRAM", "1"),
        ("PROGRAM.VERIFY", "1"),
        ("PROGRAM.CHECKSUM", "0"),
    ]
    .into_iter()
    .map(|(key, val)| (key.to_string(), val.to_string()))
    .collect()
}

/// Run every design check, then fail if any of them failed
fn run_checks<T: Transport>(client: &mut Client<T>) -> Result<bool> {
    let results = [
        client.check_timing()?,
        client.report_drc()?,
        client.report_methodology()?,
        client.report_timing()?,
    ];
    Ok(results.iter().all(|passed| *passed))
}

fn require_checks<T: Transport>(client: &mut Client<T>) -> Result<()> {
    if run_checks(client)? {
        Ok(())
    } else {
        Err(ClientError::CommandFailure {
            command: "design checks".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use crate::client::tests::{quiet_client, Scripted};
    use clap::Parser;

    const CLEAN_TIMING_CHECKS: &str = "1. checking no_clock (0)\r\n---\r\nok\r\n";
    const CLEAN_DRC: &str = "1. REPORT SUMMARY\r\n---\r\n  Violations found: 0\r\n\r\n\
                             2. REPORT DETAILS\r\n---\r\n\r\n\
                             report_drc completed successfully\r\n";
    const CLEAN_SLACK: &str = "Timing Report\r\n\r\nNo timing paths found.\r\n";

    fn command(args: &[&str]) -> Commands {
        let mut argv = vec!["vivado-remote"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap().command
    }

    fn sent_commands(client: &Client<Scripted>) -> Vec<String> {
        client
            .transport()
            .sent_text()
            .split_terminator('\r')
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_synth_sequence() {
        let cmd = command(&[
            "synth", "-p", "xc7a35t", "-c", "pins.xdc", "-v", "top.sv", "fifo.v", "-t", "top",
            "-o", "top.dcp",
        ]);
        let mut client = quiet_client(Scripted::responses(&[""; 6]));
        dispatch(&mut client, &cmd).unwrap();

        assert_eq!(
            sent_commands(&client),
            vec![
                "close_project",
                "set_part xc7a35t",
                "read_xdc {pins.xdc}",
                "read_verilog -sv {top.sv fifo.v}",
                "synth_design -top top -part xc7a35t",
                "write_checkpoint -force top.dcp",
            ]
        );
    }

    #[test]
    fn test_plain_verilog_without_constraints() {
        let cmd = command(&["synth", "-p", "xc7a35t", "-v", "top.v", "-t", "top", "-o", "top.dcp"]);
        let mut client = quiet_client(Scripted::responses(&[""; 5]));
        dispatch(&mut client, &cmd).unwrap();

        let sent = sent_commands(&client);
        assert_eq!(sent[2], "read_verilog {top.v}");
        assert_eq!(sent.len(), 5);
    }

    #[test]
    fn test_place_stops_at_first_failure() {
        let cmd = command(&["place", "-p", "xc7a35t", "-i", "synth.dcp", "-o", "place.dcp"]);
        let mut client = quiet_client(Scripted::responses(&[
            "",
            "",
            "ERROR: [Common 17-69] Command failed: file not found\r\n",
        ]));

        let err = dispatch(&mut client, &cmd).unwrap_err();
        assert!(matches!(err, ClientError::CommandFailure { ref command } if command == "read_checkpoint synth.dcp"));
        assert_eq!(sent_commands(&client).len(), 3);
    }

    #[test]
    fn test_flash_sequence() {
        let cmd = command(&["flash", "-p", "xc7a35t", "-i", "top.bin", "--memory", "s25fl128sxxxxxx0-spi-x1_x2_x4"]);
        let mut client = quiet_client(Scripted::responses(&[""; 12]));
        dispatch(&mut client, &cmd).unwrap();

        let sent = sent_commands(&client);
        assert_eq!(sent[5], "create_hw_cfgmem -hw_device [current_hw_device] s25fl128sxxxxxx0-spi-x1_x2_x4");
        assert_eq!(
            sent[6],
            "set_property -dict {PROGRAM.ADDRESS_RANGE use_file PROGRAM.BLANK_CHECK 0 \
             PROGRAM.CFG_PROGRAM 1 PROGRAM.CHECKSUM 0 PROGRAM.ERASE 1 PROGRAM.FILES top.bin \
             PROGRAM.VERIFY 1} [current_hw_cfgmem]"
        );
        assert_eq!(
            sent[7],
            "create_hw_bitstream -hw_device [current_hw_device] [get_property PROGRAM.HW_CFGMEM_BITFILE [current_hw_device]]"
        );
        assert_eq!(sent.last().map(String::as_str), Some("close_hw_manager"));
    }

    #[test]
    fn test_check_runs_every_report() {
        let failing_checks = "1. checking no_clock (3)\r\n---\r\nunclocked\r\n";
        let cmd = command(&["check", "-p", "xc7a35t", "-i", "route.dcp"]);
        let mut client = quiet_client(Scripted::responses(&[
            "",
            "",
            "",
            "",
            failing_checks,
            CLEAN_DRC,
            CLEAN_DRC,
            CLEAN_SLACK,
        ]));

        let err = dispatch(&mut client, &cmd).unwrap_err();
        assert!(matches!(err, ClientError::CommandFailure { .. }));

        let sent = sent_commands(&client);
        assert_eq!(sent.len(), 8);
        assert!(sent[7].starts_with("report_timing"));
    }

    #[test]
    fn test_bitstream_with_clean_checks() {
        let cmd = command(&["bitstream", "-p", "xc7a35t", "-i", "route.dcp", "-o", "top.bit", "--check"]);
        let mut client = quiet_client(Scripted::responses(&[
            "",
            "",
            "",
            "",
            "",
            CLEAN_TIMING_CHECKS,
            CLEAN_DRC,
            CLEAN_DRC,
            CLEAN_SLACK,
        ]));
        dispatch(&mut client, &cmd).unwrap();
        assert_eq!(sent_commands(&client)[4], "write_bitstream -force top.bit");
    }

    #[test]
    fn test_cfg_mem_command() {
        let cmd = command(&[
            "cfg_mem", "-p", "xc7a35t", "-i", "top.bit", "-o", "top.bin", "--size", "16",
            "--interface", "SPIx4",
        ]);
        let mut client = quiet_client(Scripted::responses(&[""; 3]));
        dispatch(&mut client, &cmd).unwrap();
        assert_eq!(
            sent_commands(&client)[2],
            "write_cfgmem -format bin -size 16 -interface SPIx4 -loadbit {up 0x00000000 top.bit} -force -file top.bin"
        );
    }
}

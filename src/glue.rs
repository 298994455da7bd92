//! Glue code generation for located variables.
//!
//! The transpiler emits `LOCATED_VARIABLES.h`, one `__LOCATED_VAR(...)`
//! record per hardware-bound variable. This module parses those records and
//! generates `glueVars.c`, wiring each variable into the fixed-size I/O
//! buffer arrays the runtime scans every cycle.
//!
//! Address checking is strict: a variable outside the bounds of its class
//! aborts generation for the whole file, so a partially correct glue file is
//! never produced.
//!
//! # Example
//!
//! ```rust
//! use firmware_builder::glue::VarClass;
//!
//! // The direction/size marker is matched anywhere in the mangled name.
//! assert_eq!(VarClass::classify("__QX0_1"), Some(VarClass::OutputBit));
//! assert_eq!(VarClass::classify("__IW3"), Some(VarClass::InputWord));
//! assert_eq!(VarClass::classify("__TEMP0"), None);
//! ```

use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::logging::BuildLog;

/// Marker identifying a meaningful line in the declarations file.
pub const LOCATED_VAR_MARKER: &str = "__LOCATED_VAR(";

/// Fixed head of the generated file: macro expansion of the declarations,
/// runtime state, and the target-selected buffer presets.
const GLUE_HEADER: &str = r#"
#include "iec_std_lib.h"

#define __LOCATED_VAR(type, name, ...) type __##name;
#include "LOCATED_VARIABLES.h"
#undef __LOCATED_VAR
#define __LOCATED_VAR(type, name, ...) type* name = &__##name;
#include "LOCATED_VARIABLES.h"
#undef __LOCATED_VAR

TIME __CURRENT_TIME;
BOOL __DEBUG;
extern unsigned long long common_ticktime__;

//I/O buffers
#if defined(__AVR_ATmega328P__) || defined(__AVR_ATmega168__) || defined(__AVR_ATmega32U4__) || defined(__AVR_ATmega16U4__)

#define MAX_DIGITAL_INPUT          8
#define MAX_DIGITAL_OUTPUT         32
#define MAX_ANALOG_INPUT           6
#define MAX_ANALOG_OUTPUT          32
#define MAX_MEMORY_WORD            0
#define MAX_MEMORY_DWORD           0
#define MAX_MEMORY_LWORD           0

IEC_BOOL *bool_input[MAX_DIGITAL_INPUT/8][8];
IEC_BOOL *bool_output[MAX_DIGITAL_OUTPUT/8][8];
IEC_UINT *int_input[MAX_ANALOG_INPUT];
IEC_UINT *int_output[MAX_ANALOG_OUTPUT];

#else

#define MAX_DIGITAL_INPUT          56
#define MAX_DIGITAL_OUTPUT         56
#define MAX_ANALOG_INPUT           32
#define MAX_ANALOG_OUTPUT          32
#define MAX_MEMORY_WORD            20
#define MAX_MEMORY_DWORD           20
#define MAX_MEMORY_LWORD           20

IEC_BOOL *bool_input[MAX_DIGITAL_INPUT/8][8];
IEC_BOOL *bool_output[MAX_DIGITAL_OUTPUT/8][8];
IEC_UINT *int_input[MAX_ANALOG_INPUT];
IEC_UINT *int_output[MAX_ANALOG_OUTPUT];
IEC_UINT *int_memory[MAX_MEMORY_WORD];
IEC_UDINT *dint_memory[MAX_MEMORY_DWORD];
IEC_ULINT *lint_memory[MAX_MEMORY_LWORD];

#endif


void glueVars()
{
"#;

/// Fixed tail: closes the wiring function and appends the tick accumulator.
const GLUE_FOOTER: &str = r#"}

void updateTime()
{
    __CURRENT_TIME.tv_nsec += common_ticktime__;

    if (__CURRENT_TIME.tv_nsec >= 1000000000)
    {
        __CURRENT_TIME.tv_nsec -= 1000000000;
        __CURRENT_TIME.tv_sec += 1;
    }
}
"#;

/// Address class of a located variable, dispatched on the IEC direction/size
/// marker embedded in the variable name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarClass {
    OutputBit,
    InputBit,
    OutputWord,
    InputWord,
    MemoryWord,
    MemoryDouble,
    MemoryLong,
}

impl VarClass {
    /// Classify a variable name by substring containment, in fixed order.
    ///
    /// Substring (not prefix) matching is deliberate: it mirrors how the
    /// transpiler mangles location markers into generated names.
    pub fn classify(name: &str) -> Option<VarClass> {
        const TABLE: &[(&str, VarClass)] = &[
            ("QX", VarClass::OutputBit),
            ("IX", VarClass::InputBit),
            ("QW", VarClass::OutputWord),
            ("IW", VarClass::InputWord),
            ("MW", VarClass::MemoryWord),
            ("MD", VarClass::MemoryDouble),
            ("ML", VarClass::MemoryLong),
        ];
        TABLE
            .iter()
            .find(|(marker, _)| name.contains(marker))
            .map(|(_, class)| *class)
    }

    /// Target buffer array in the generated file.
    fn buffer(&self) -> &'static str {
        match self {
            VarClass::OutputBit => "bool_output",
            VarClass::InputBit => "bool_input",
            VarClass::OutputWord => "int_output",
            VarClass::InputWord => "int_input",
            VarClass::MemoryWord => "int_memory",
            VarClass::MemoryDouble => "dint_memory",
            VarClass::MemoryLong => "lint_memory",
        }
    }

    /// Inclusive upper bound for the primary address.
    fn address_bound(&self) -> u32 {
        match self {
            VarClass::OutputBit | VarClass::InputBit => 6,
            VarClass::OutputWord | VarClass::InputWord => 32,
            VarClass::MemoryWord | VarClass::MemoryDouble | VarClass::MemoryLong => 20,
        }
    }

    /// Bit classes carry a sub-address (bit position within a byte group).
    fn is_bit(&self) -> bool {
        matches!(self, VarClass::OutputBit | VarClass::InputBit)
    }
}

/// One parsed `__LOCATED_VAR` record.
#[derive(Debug, Clone)]
pub struct LocatedVariable {
    pub ty: String,
    pub name: String,
    pub address: u32,
    pub subaddress: u32,
}

impl LocatedVariable {
    /// Validate against the bound table and render the wiring statement.
    fn wiring_line(&self) -> Result<String> {
        let Some(class) = VarClass::classify(&self.name) else {
            bail!("unrecognized location class in variable '{}'", self.name);
        };

        let in_bounds = self.address <= class.address_bound()
            && (!class.is_bit() || self.subaddress <= 7);
        if !in_bounds {
            bail!(
                "wrong location for var {} (address {}, sub-address {})",
                self.name,
                self.address,
                self.subaddress
            );
        }

        if class.is_bit() {
            Ok(format!(
                "    {}[{}][{}] = {};\n",
                class.buffer(),
                self.address,
                self.subaddress,
                self.name
            ))
        } else {
            Ok(format!(
                "    {}[{}] = {};\n",
                class.buffer(),
                self.address,
                self.name
            ))
        }
    }
}

/// Extract the parenthesized argument list of a marker line.
fn argument_list(line: &str) -> Option<&str> {
    let after = line.split('(').nth(1)?;
    after.split(')').next()
}

/// Parse one meaningful line into a located variable.
///
/// Returns `Ok(None)` for a structural error (fewer than five fields), which
/// is recoverable at the line level: the scan continues so every bad line is
/// reported, but generation as a whole must fail afterwards.
fn parse_located_line(line: &str, log: &BuildLog) -> Result<Option<LocatedVariable>> {
    let Some(arguments) = argument_list(line) else {
        log.line(&format!("Error processing located var line: {}", line.trim()));
        return Ok(None);
    };

    let fields: Vec<&str> = arguments.split(',').map(str::trim).collect();
    if fields.len() < 5 {
        log.line(&format!("Error processing located var line: {}", arguments));
        return Ok(None);
    }

    let address: u32 = fields[4]
        .parse()
        .with_context(|| format!("invalid address '{}' for var {}", fields[4], fields[1]))?;
    let subaddress: u32 = if fields.len() > 5 {
        fields[5]
            .parse()
            .with_context(|| format!("invalid sub-address '{}' for var {}", fields[5], fields[1]))?
    } else {
        0
    };

    Ok(Some(LocatedVariable {
        ty: fields[0].to_string(),
        name: fields[1].to_string(),
        address,
        subaddress,
    }))
}

/// Render the complete glue file from the declarations text.
///
/// Bound violations and unrecognized classes abort immediately; structural
/// errors are collected and fail the result after the full scan.
pub fn render_glue_source(located_text: &str, log: &BuildLog) -> Result<String> {
    let mut wiring = String::new();
    let mut bad_lines = 0usize;

    for line in located_text.lines() {
        if !line.contains(LOCATED_VAR_MARKER) {
            continue;
        }
        match parse_located_line(line, log)? {
            Some(var) => {
                let statement = var.wiring_line().inspect_err(|err| {
                    log.line(&format!("Error: {}", err));
                })?;
                wiring.push_str(&statement);
            }
            None => bad_lines += 1,
        }
    }

    if bad_lines > 0 {
        bail!("{} located variable line(s) could not be parsed", bad_lines);
    }

    Ok(format!("{}{}{}", GLUE_HEADER, wiring, GLUE_FOOTER))
}

/// Generate `glueVars.c` at `out_path` from the declarations text.
///
/// On any error nothing is written, so a stale or partial glue file never
/// reaches the compiler.
pub fn generate_glue_file(located_text: &str, out_path: &Path, log: &BuildLog) -> Result<()> {
    let source = render_glue_source(located_text, log)?;
    std::fs::write(out_path, source)
        .with_context(|| format!("writing glue file '{}'", out_path.display()))
}

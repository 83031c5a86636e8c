//! WGSL source for the three kernels.
//!
//! Shader source is generated per element type, operator, workgroup size and
//! subgroup size. The shared-memory levels of the [`SharedLayout`] are
//! unrolled on the host, so the emitted code has no loops and every barrier
//! sits in workgroup-uniform control flow.
//!
//! Subgroup operations are only ever issued with all lanes of a subgroup
//! active: lanes outside the data load the identity instead of branching
//! around the operation.

use super::KernelKind;
use crate::element::Element;
use crate::kernel::Access;
use crate::op::CombineOp;
use crate::plan::SharedLayout;
use core::fmt::{self, Display, Write as _};
use core::marker::PhantomData;

/// Entry point of the subgroup probe, see [`probe_source`].
pub const PROBE_ENTRY_POINT: &str = "probe_cs";

fn binding_names(kind: KernelKind) -> &'static [&'static str] {
    match kind {
        KernelKind::Reduce => &["input", "partials"],
        KernelKind::ScanLocal => &["input", "output", "partials"],
        KernelKind::Propagate => &["data", "carries"],
    }
}

/// A kernel, printed as a complete WGSL module.
pub struct KernelSource<'a, T, O> {
    kind: KernelKind,
    workgroup_size: u32,
    layout: &'a SharedLayout,
    _marker: PhantomData<fn() -> (T, O)>,
}

impl<'a, T: Element, O: CombineOp<T>> KernelSource<'a, T, O> {
    pub fn new(kind: KernelKind, workgroup_size: u32, layout: &'a SharedLayout) -> Self {
        Self {
            kind,
            workgroup_size,
            layout,
            _marker: PhantomData,
        }
    }

    fn uses_subgroups(&self) -> bool {
        self.kind != KernelKind::Propagate
    }

    fn format_header(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ty = T::WGSL_TYPE;
        f.write_str(
            "struct Params {
    len: u32,
    workgroup_count: u32,
    grid_width: u32,
    _pad: u32,
}

@group(0) @binding(0) var<uniform> params: Params;
",
        )?;
        for (binding, (name, access)) in binding_names(self.kind)
            .iter()
            .zip(self.kind.bindings())
            .enumerate()
        {
            let access = match access {
                Access::Read => "read",
                Access::ReadWrite => "read_write",
            };
            writeln!(
                f,
                "@group(0) @binding({}) var<storage, {access}> {name}: array<{ty}>;",
                binding + 1
            )?;
        }

        write!(
            f,
            "
const WORKGROUP_SIZE: u32 = {}u;
const SUBGROUP_SIZE: u32 = {}u;
",
            self.workgroup_size, self.layout.subgroup_size
        )?;
        if self.uses_subgroups() && !self.layout.levels.is_empty() {
            write!(
                f,
                "
var<workgroup> shared_partials: array<{ty}, {}>;
",
                self.layout.capacity()
            )?;
        }

        write!(
            f,
            "
fn identity() -> {ty} {{
    return {};
}}

fn combine(a: {ty}, b: {ty}) -> {ty} {{
    return {};
}}
",
            O::identity().wgsl_literal(),
            O::wgsl_combine("a", "b"),
        )?;

        if self.uses_subgroups() {
            write!(
                f,
                "
fn subgroup_reduce(value: {ty}) -> {ty} {{
    return {}(value);
}}
",
                O::WGSL_SUBGROUP_REDUCE
            )?;
            self.format_subgroup_scan(f)?;
        }
        Ok(())
    }

    fn format_subgroup_scan(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ty = T::WGSL_TYPE;
        writeln!(f, "\nfn subgroup_scan(value: {ty}, lane: u32) -> {ty} {{")?;
        match O::WGSL_SUBGROUP_INCLUSIVE_SCAN {
            Some(scan) => writeln!(f, "    return {scan}(value);")?,
            None => {
                f.write_str("    var acc = value;\n")?;
                let mut delta = 1;
                while delta < self.layout.subgroup_size {
                    write!(
                        f,
                        "    let up_{delta} = subgroupShuffleUp(acc, {delta}u);
    acc = select(acc, {}, lane >= {delta}u);
",
                        O::wgsl_combine(&format!("up_{delta}"), "acc")
                    )?;
                    delta <<= 1;
                }
                f.write_str("    return acc;\n")?;
            }
        }
        f.write_str("}\n")
    }

    fn format_entry(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "
@compute
@workgroup_size({})
fn {}(
    @builtin(workgroup_id) workgroup_id: vec3<u32>,
    @builtin(local_invocation_index) local_idx: u32,
",
            self.workgroup_size,
            self.kind.entry_point()
        )?;
        if self.uses_subgroups() {
            f.write_str("    @builtin(subgroup_invocation_id) lane: u32,\n")?;
        }
        f.write_str(
            ") {
    let group = workgroup_id.y * params.grid_width + workgroup_id.x;
",
        )?;
        // Both conditions are uniform across the workgroup.
        if self.kind == KernelKind::Propagate {
            f.write_str("    if group == 0u || group >= params.workgroup_count {\n")?;
        } else {
            f.write_str("    if group >= params.workgroup_count {\n")?;
        }
        f.write_str(
            "        return;
    }
    let sg = local_idx / SUBGROUP_SIZE;
    let index = group * WORKGROUP_SIZE + local_idx;
",
        )?;

        match self.kind {
            KernelKind::Reduce => self.format_reduce_body(f)?,
            KernelKind::ScanLocal => self.format_scan_body(f)?,
            KernelKind::Propagate => f.write_str(
                "    if index < params.len {
        data[index] = combine(carries[group - 1u], data[index]);
    }
",
            )?,
        }
        f.write_str("}\n")
    }

    fn format_reduce_body(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(
            "    var value = identity();
    if index < params.len {
        value = input[index];
    }
    var total = subgroup_reduce(value);
",
        )?;

        let levels = &self.layout.levels;
        if let Some((top, lower)) = levels.split_last() {
            f.write_str(
                "    if lane == 0u {
        shared_partials[sg] = total;
    }
    workgroupBarrier();
",
            )?;
            for (level, next) in lower.iter().zip(&levels[1..]) {
                write!(
                    f,
                    "    {{
        let slot = sg * SUBGROUP_SIZE + lane;
        var partial = identity();
        if slot < {count}u {{
            partial = shared_partials[{offset}u + slot];
        }}
        let folded = subgroup_reduce(partial);
        if lane == 0u && slot < {count}u {{
            shared_partials[{next}u + sg] = folded;
        }}
    }}
    workgroupBarrier();
",
                    count = level.count,
                    offset = level.offset,
                    next = next.offset,
                )?;
            }
            write!(
                f,
                "    {{
        var partial = identity();
        if lane < {count}u {{
            partial = shared_partials[{offset}u + lane];
        }}
        total = subgroup_reduce(partial);
    }}
",
                count = top.count,
                offset = top.offset,
            )?;
        }

        f.write_str(
            "    if local_idx == 0u {
        partials[group] = total;
    }
",
        )
    }

    fn format_scan_body(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(
            "    var value = identity();
    if index < params.len {
        value = input[index];
    }
    value = subgroup_scan(value, lane);
",
        )?;

        let levels = &self.layout.levels;
        if !levels.is_empty() {
            f.write_str(
                "    if lane == SUBGROUP_SIZE - 1u {
        shared_partials[sg] = value;
    }
    workgroupBarrier();
",
            )?;

            for (depth, level) in levels.iter().enumerate() {
                write!(
                    f,
                    "    {{
        let slot = sg * SUBGROUP_SIZE + lane;
        var partial = identity();
        if slot < {count}u {{
            partial = shared_partials[{offset}u + slot];
        }}
        partial = subgroup_scan(partial, lane);
        if slot < {count}u {{
            shared_partials[{offset}u + slot] = partial;
        }}
",
                    count = level.count,
                    offset = level.offset,
                )?;
                if let Some(next) = levels.get(depth + 1) {
                    write!(
                        f,
                        "        if lane == SUBGROUP_SIZE - 1u && sg * SUBGROUP_SIZE < {count}u {{
            shared_partials[{next}u + sg] = partial;
        }}
",
                        count = level.count,
                        next = next.offset,
                    )?;
                }
                f.write_str(
                    "    }
    workgroupBarrier();
",
                )?;
            }

            for depth in (0..levels.len() - 1).rev() {
                let (level, next) = (levels[depth], levels[depth + 1]);
                write!(
                    f,
                    "    if local_idx >= SUBGROUP_SIZE && local_idx < {count}u {{
        let carry = shared_partials[{next}u + local_idx / SUBGROUP_SIZE - 1u];
        shared_partials[{offset}u + local_idx] = combine(carry, shared_partials[{offset}u + local_idx]);
    }}
    workgroupBarrier();
",
                    count = level.count,
                    offset = level.offset,
                    next = next.offset,
                )?;
            }

            f.write_str(
                "    if sg > 0u {
        value = combine(shared_partials[sg - 1u], value);
    }
",
            )?;
        }

        f.write_str(
            "    if index < params.len {
        output[index] = value;
    }
    if local_idx == WORKGROUP_SIZE - 1u {
        partials[group] = value;
    }
",
        )
    }
}

impl<T: Element, O: CombineOp<T>> Display for KernelSource<'_, T, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.format_header(f)?;
        self.format_entry(f)
    }
}

/// A one-workgroup kernel writing `(subgroup_invocation_id, subgroup_size)`
/// for every invocation, used to check the subgroup layout a device reports.
pub fn probe_source(workgroup_size: u32) -> String {
    let mut source = String::new();
    // Writing to a `String` cannot fail.
    let _ = write!(
        source,
        "@group(0) @binding(0) var<storage, read_write> probe: array<u32>;

@compute
@workgroup_size({workgroup_size})
fn {PROBE_ENTRY_POINT}(
    @builtin(local_invocation_index) local_idx: u32,
    @builtin(subgroup_invocation_id) lane: u32,
    @builtin(subgroup_size) size: u32,
) {{
    probe[2u * local_idx] = lane;
    probe[2u * local_idx + 1u] = size;
}}
"
    );
    source
}

//! Per-opcode dispatch table.
//!
//! Every one of the 256 opcodes has a [`CommandInfo`]: flags telling the
//! dispatcher whether to flush before the write and whether to run a handler,
//! the dirty flags a changed value raises, and the handler itself. The table is
//! built once by [`CommandTable::new`]; [`CommandTable::apply_features`] is the
//! only thing that patches it afterwards.

use crate::backend::DrawContext;
use crate::command::*;
use crate::config::GpuConfig;
use crate::gpu::PspGpu;
use crate::gstate::DirtyFlags as D;
use crate::handlers;
use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CommandFlags: u32 {
        /// Flush pending draws before every write
        const FLUSH_BEFORE = 1 << 0;
        /// Flush pending draws before a write that changes the value
        const FLUSH_BEFORE_ON_CHANGE = 1 << 1;
        const EXECUTE = 1 << 2;
        const EXECUTE_ON_CHANGE = 1 << 3;
        const READS_PC = 1 << 4;
        const WRITES_PC = 1 << 5;
        /// Raise the entry's dirty flags when the value changes
        const DIRTY_ON_CHANGE = 1 << 6;
        /// Not a known command; the word is logged and skipped
        const UNKNOWN = 1 << 7;
    }
}

/// Handler signature: the full command word and its xor with the previous one.
pub type CmdHandler<Ctx> = fn(&mut PspGpu<Ctx>, u32, u32);

pub struct CommandInfo<Ctx: DrawContext> {
    pub name: &'static str,
    pub flags: CommandFlags,
    pub dirty: D,
    pub handler: Option<CmdHandler<Ctx>>,
}

impl<Ctx: DrawContext> Clone for CommandInfo<Ctx> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Ctx: DrawContext> Copy for CommandInfo<Ctx> {}

impl<Ctx: DrawContext> std::fmt::Debug for CommandInfo<Ctx> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandInfo")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .field("dirty", &self.dirty)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

impl<Ctx: DrawContext> CommandInfo<Ctx> {
    const UNKNOWN: Self = Self {
        name: "unknown",
        flags: CommandFlags::UNKNOWN,
        dirty: D::empty(),
        handler: None,
    };

    #[inline]
    pub fn is_known(&self) -> bool {
        !self.flags.contains(CommandFlags::UNKNOWN)
    }
}

const X: CommandFlags = CommandFlags::EXECUTE;
const XC: CommandFlags = CommandFlags::EXECUTE_ON_CHANGE;
const FB: CommandFlags = CommandFlags::FLUSH_BEFORE;
const FBC: CommandFlags = CommandFlags::FLUSH_BEFORE_ON_CHANGE;
const RPC: CommandFlags = CommandFlags::READS_PC;
const WPC: CommandFlags = CommandFlags::WRITES_PC;
const NONE: CommandFlags = CommandFlags::empty();

/// Opcode range (inclusive), name, flags, dirty flags on change.
type Entry = (u8, u8, &'static str, CommandFlags, D);

const fn f(a: CommandFlags, b: CommandFlags) -> CommandFlags {
    a.union(b)
}

const SHADERS: D = D::VERTEXSHADER_STATE.union(D::FRAGMENTSHADER_STATE);
const VIEWPORT_XY: D = D::FRAMEBUF
    .union(D::VIEWPORTSCISSOR_STATE)
    .union(D::CULLRANGE);
const VIEWPORT_Z: D = D::DEPTHRANGE.union(D::CULLRANGE);

#[rustfmt::skip]
const ENTRIES: &[Entry] = &[
    (GE_CMD_NOP, GE_CMD_NOP, "nop", NONE, D::empty()),
    (GE_CMD_VADDR, GE_CMD_VADDR, "vaddr", X, D::empty()),
    (GE_CMD_IADDR, GE_CMD_IADDR, "iaddr", X, D::empty()),
    (GE_CMD_PRIM, GE_CMD_PRIM, "prim", X, D::empty()),
    (GE_CMD_BEZIER, GE_CMD_BEZIER, "bezier", f(FB, X), D::empty()),
    (GE_CMD_SPLINE, GE_CMD_SPLINE, "spline", f(FB, X), D::empty()),
    (GE_CMD_BOUNDINGBOX, GE_CMD_BOUNDINGBOX, "boundingbox", f(FB, X), D::empty()),
    (GE_CMD_JUMP, GE_CMD_JUMP, "jump", f(f(X, RPC), WPC), D::empty()),
    (GE_CMD_BJUMP, GE_CMD_BJUMP, "bjump", f(f(X, RPC), WPC), D::empty()),
    (GE_CMD_CALL, GE_CMD_CALL, "call", f(f(X, RPC), WPC), D::empty()),
    (GE_CMD_RET, GE_CMD_RET, "ret", f(f(X, RPC), WPC), D::empty()),
    (GE_CMD_END, GE_CMD_END, "end", f(f(FB, X), f(RPC, WPC)), D::empty()),
    (GE_CMD_SIGNAL, GE_CMD_SIGNAL, "signal", f(FB, X), D::empty()),
    (GE_CMD_FINISH, GE_CMD_FINISH, "finish", f(FB, X), D::empty()),
    (GE_CMD_BASE, GE_CMD_BASE, "base", NONE, D::empty()),
    (GE_CMD_VERTEXTYPE, GE_CMD_VERTEXTYPE, "vertextype", f(FBC, XC), D::UVSCALEOFFSET),
    (GE_CMD_OFFSETADDR, GE_CMD_OFFSETADDR, "offsetaddr", X, D::empty()),
    (GE_CMD_ORIGIN, GE_CMD_ORIGIN, "origin", f(X, RPC), D::empty()),
    (GE_CMD_REGION1, GE_CMD_REGION2, "region", FBC, D::FRAMEBUF.union(D::VIEWPORTSCISSOR_STATE)),
    (GE_CMD_LIGHTINGENABLE, GE_CMD_LIGHTINGENABLE, "lightingenable", FBC, SHADERS),
    (GE_CMD_LIGHTENABLE0, GE_CMD_LIGHTENABLE3, "lightenable", FBC, D::VERTEXSHADER_STATE),
    (GE_CMD_DEPTHCLAMPENABLE, GE_CMD_DEPTHCLAMPENABLE, "depthclampenable", FBC, D::RASTER_STATE),
    (GE_CMD_CULLFACEENABLE, GE_CMD_CULLFACEENABLE, "cullfaceenable", FBC, D::RASTER_STATE),
    (GE_CMD_TEXTUREMAPENABLE, GE_CMD_TEXTUREMAPENABLE, "texturemapenable", FBC, SHADERS.union(D::UVSCALEOFFSET)),
    (GE_CMD_FOGENABLE, GE_CMD_FOGENABLE, "fogenable", FBC, SHADERS.union(D::FOGCOEF)),
    (GE_CMD_DITHERENABLE, GE_CMD_DITHERENABLE, "ditherenable", FBC, D::RASTER_STATE),
    (GE_CMD_ALPHABLENDENABLE, GE_CMD_ALPHABLENDENABLE, "alphablendenable", FBC, D::BLEND_STATE),
    (GE_CMD_ALPHATESTENABLE, GE_CMD_ALPHATESTENABLE, "alphatestenable", FBC, D::FRAGMENTSHADER_STATE),
    (GE_CMD_ZTESTENABLE, GE_CMD_ZTESTENABLE, "ztestenable", FBC, D::DEPTHSTENCIL_STATE.union(D::FRAGMENTSHADER_STATE)),
    (GE_CMD_STENCILTESTENABLE, GE_CMD_STENCILTESTENABLE, "stenciltestenable", FBC, D::DEPTHSTENCIL_STATE.union(D::FRAGMENTSHADER_STATE)),
    (GE_CMD_ANTIALIASENABLE, GE_CMD_ANTIALIASENABLE, "antialiasenable", FBC, D::RASTER_STATE),
    (GE_CMD_PATCHCULLENABLE, GE_CMD_PATCHCULLENABLE, "patchcullenable", FBC, D::RASTER_STATE),
    (GE_CMD_COLORTESTENABLE, GE_CMD_COLORTESTENABLE, "colortestenable", FBC, D::FRAGMENTSHADER_STATE),
    (GE_CMD_LOGICOPENABLE, GE_CMD_LOGICOPENABLE, "logicopenable", FBC, D::BLEND_STATE.union(D::FRAGMENTSHADER_STATE)),
    (GE_CMD_BONEMATRIXNUMBER, GE_CMD_BONEMATRIXNUMBER, "bonematrixnumber", X, D::empty()),
    (GE_CMD_BONEMATRIXDATA, GE_CMD_BONEMATRIXDATA, "bonematrixdata", X, D::empty()),
    (GE_CMD_MORPHWEIGHT0, GE_CMD_MORPHWEIGHT7, "morphweight", FBC, D::MORPHWEIGHTS),
    (GE_CMD_PATCHDIVISION, GE_CMD_PATCHDIVISION, "patchdivision", FBC, D::BEZIERSPLINE),
    (GE_CMD_PATCHPRIMITIVE, GE_CMD_PATCHPRIMITIVE, "patchprimitive", FBC, D::BEZIERSPLINE),
    (GE_CMD_PATCHFACING, GE_CMD_PATCHFACING, "patchfacing", FBC, D::RASTER_STATE),
    (GE_CMD_WORLDMATRIXNUMBER, GE_CMD_WORLDMATRIXNUMBER, "worldmatrixnumber", X, D::empty()),
    (GE_CMD_WORLDMATRIXDATA, GE_CMD_WORLDMATRIXDATA, "worldmatrixdata", X, D::empty()),
    (GE_CMD_VIEWMATRIXNUMBER, GE_CMD_VIEWMATRIXNUMBER, "viewmatrixnumber", X, D::empty()),
    (GE_CMD_VIEWMATRIXDATA, GE_CMD_VIEWMATRIXDATA, "viewmatrixdata", X, D::empty()),
    (GE_CMD_PROJMATRIXNUMBER, GE_CMD_PROJMATRIXNUMBER, "projmatrixnumber", X, D::empty()),
    (GE_CMD_PROJMATRIXDATA, GE_CMD_PROJMATRIXDATA, "projmatrixdata", X, D::empty()),
    (GE_CMD_TGENMATRIXNUMBER, GE_CMD_TGENMATRIXNUMBER, "tgenmatrixnumber", X, D::empty()),
    (GE_CMD_TGENMATRIXDATA, GE_CMD_TGENMATRIXDATA, "tgenmatrixdata", X, D::empty()),
    (GE_CMD_VIEWPORTXSCALE, GE_CMD_VIEWPORTYSCALE, "viewportscale", FBC, VIEWPORT_XY),
    (GE_CMD_VIEWPORTZSCALE, GE_CMD_VIEWPORTZSCALE, "viewportzscale", FBC, VIEWPORT_Z),
    (GE_CMD_VIEWPORTXCENTER, GE_CMD_VIEWPORTYCENTER, "viewportcenter", FBC, VIEWPORT_XY),
    (GE_CMD_VIEWPORTZCENTER, GE_CMD_VIEWPORTZCENTER, "viewportzcenter", FBC, VIEWPORT_Z),
    (GE_CMD_TEXSCALEU, GE_CMD_TEXOFFSETV, "texscaleoffset", FBC, D::UVSCALEOFFSET),
    (GE_CMD_OFFSETX, GE_CMD_OFFSETY, "screenoffset", FBC, D::VIEWPORTSCISSOR_STATE.union(D::CULLRANGE)),
    (GE_CMD_SHADEMODE, GE_CMD_SHADEMODE, "shademode", FBC, D::VERTEXSHADER_STATE),
    (GE_CMD_REVERSENORMAL, GE_CMD_REVERSENORMAL, "reversenormal", FBC, D::VERTEXSHADER_STATE),
    (GE_CMD_MATERIALUPDATE, GE_CMD_MATERIALUPDATE, "materialupdate", FBC, D::VERTEXSHADER_STATE),
    (GE_CMD_MATERIALEMISSIVE, GE_CMD_MATERIALALPHA, "material", FBC, D::MATERIAL),
    (GE_CMD_MATERIALSPECULARCOEF, GE_CMD_MATERIALSPECULARCOEF, "materialspecularcoef", FBC, D::MATERIAL),
    (GE_CMD_AMBIENTCOLOR, GE_CMD_AMBIENTALPHA, "ambient", FBC, D::AMBIENT),
    (GE_CMD_LIGHTMODE, GE_CMD_LIGHTMODE, "lightmode", FBC, D::VERTEXSHADER_STATE),
    (GE_CMD_LIGHTTYPE0, GE_CMD_LIGHTTYPE3, "lighttype", FBC, D::VERTEXSHADER_STATE),
    (GE_CMD_LX0, GE_CMD_LSC3, "light", FBC, D::empty()),
    (GE_CMD_CULL, GE_CMD_CULL, "cull", FBC, D::RASTER_STATE),
    (GE_CMD_FRAMEBUFPTR, GE_CMD_FRAMEBUFWIDTH, "framebuf", FBC, D::FRAMEBUF.union(D::TEXTURE_PARAMS)),
    (GE_CMD_ZBUFPTR, GE_CMD_ZBUFWIDTH, "zbuf", FBC, D::FRAMEBUF),
    (GE_CMD_TEXADDR0, GE_CMD_TEXADDR0, "texaddr0", FBC, D::TEXTURE_IMAGE.union(D::UVSCALEOFFSET)),
    (GE_CMD_TEXADDR0 + 1, GE_CMD_TEXADDR7, "texaddr", FBC, D::TEXTURE_PARAMS),
    (GE_CMD_TEXBUFWIDTH0, GE_CMD_TEXBUFWIDTH0, "texbufwidth0", FBC, D::TEXTURE_IMAGE),
    (GE_CMD_TEXBUFWIDTH0 + 1, GE_CMD_TEXBUFWIDTH7, "texbufwidth", FBC, D::TEXTURE_PARAMS),
    (GE_CMD_CLUTADDR, GE_CMD_CLUTADDRUPPER, "clutaddr", NONE, D::empty()),
    (GE_CMD_TRANSFERSRC, GE_CMD_TRANSFERDSTW, "transferaddr", NONE, D::empty()),
    (GE_CMD_TEXSIZE0, GE_CMD_TEXSIZE0, "texsize0", f(FBC, X), D::empty()),
    (GE_CMD_TEXSIZE0 + 1, GE_CMD_TEXSIZE7, "texsize", FBC, D::TEXTURE_PARAMS),
    (GE_CMD_TEXMAPMODE, GE_CMD_TEXMAPMODE, "texmapmode", FBC, SHADERS.union(D::UVSCALEOFFSET)),
    (GE_CMD_TEXSHADELS, GE_CMD_TEXSHADELS, "texshadels", FBC, D::VERTEXSHADER_STATE),
    (GE_CMD_TEXMODE, GE_CMD_TEXMODE, "texmode", FBC, D::TEXTURE_IMAGE),
    (GE_CMD_TEXFORMAT, GE_CMD_TEXFORMAT, "texformat", FBC, D::TEXTURE_IMAGE),
    (GE_CMD_LOADCLUT, GE_CMD_LOADCLUT, "loadclut", f(FBC, X), D::empty()),
    (GE_CMD_CLUTFORMAT, GE_CMD_CLUTFORMAT, "clutformat", FBC, D::TEXTURE_PARAMS.union(D::DEPAL)),
    (GE_CMD_TEXFILTER, GE_CMD_TEXFILTER, "texfilter", FBC, D::TEXTURE_PARAMS),
    (GE_CMD_TEXWRAP, GE_CMD_TEXWRAP, "texwrap", FBC, D::TEXTURE_PARAMS.union(D::FRAGMENTSHADER_STATE)),
    (GE_CMD_TEXLEVEL, GE_CMD_TEXLEVEL, "texlevel", FBC, D::TEXTURE_PARAMS),
    (GE_CMD_TEXFUNC, GE_CMD_TEXFUNC, "texfunc", FBC, D::FRAGMENTSHADER_STATE),
    (GE_CMD_TEXENVCOLOR, GE_CMD_TEXENVCOLOR, "texenvcolor", FBC, D::TEXENV),
    (GE_CMD_TEXFLUSH, GE_CMD_TEXFLUSH, "texflush", f(FB, X), D::empty()),
    (GE_CMD_TEXSYNC, GE_CMD_TEXSYNC, "texsync", NONE, D::empty()),
    (GE_CMD_FOG1, GE_CMD_FOG2, "fogcoef", FBC, D::FOGCOEF),
    (GE_CMD_FOGCOLOR, GE_CMD_FOGCOLOR, "fogcolor", FBC, D::FOGCOLOR),
    (GE_CMD_TEXLODSLOPE, GE_CMD_TEXLODSLOPE, "texlodslope", FBC, D::TEXTURE_PARAMS),
    (GE_CMD_FRAMEBUFPIXFORMAT, GE_CMD_FRAMEBUFPIXFORMAT, "framebufpixformat", FBC, D::FRAMEBUF.union(D::FRAGMENTSHADER_STATE).union(D::BLEND_STATE)),
    (GE_CMD_CLEARMODE, GE_CMD_CLEARMODE, "clearmode", FBC, SHADERS.union(D::BLEND_STATE).union(D::DEPTHSTENCIL_STATE).union(D::RASTER_STATE)),
    (GE_CMD_SCISSOR1, GE_CMD_SCISSOR2, "scissor", FBC, D::FRAMEBUF.union(D::VIEWPORTSCISSOR_STATE)),
    (GE_CMD_MINZ, GE_CMD_MAXZ, "depthrange", FBC, D::DEPTHRANGE.union(D::VIEWPORTSCISSOR_STATE)),
    (GE_CMD_COLORTEST, GE_CMD_COLORTEST, "colortest", FBC, D::FRAGMENTSHADER_STATE),
    (GE_CMD_COLORREF, GE_CMD_COLORREF, "colorref", FBC, D::ALPHACOLORREF),
    (GE_CMD_COLORTESTMASK, GE_CMD_COLORTESTMASK, "colortestmask", FBC, D::ALPHACOLORMASK),
    (GE_CMD_ALPHATEST, GE_CMD_ALPHATEST, "alphatest", FBC, D::ALPHACOLORREF.union(D::ALPHACOLORMASK).union(D::FRAGMENTSHADER_STATE)),
    (GE_CMD_STENCILTEST, GE_CMD_STENCILTEST, "stenciltest", FBC, D::STENCILREPLACEVALUE.union(D::DEPTHSTENCIL_STATE)),
    (GE_CMD_STENCILOP, GE_CMD_STENCILOP, "stencilop", FBC, D::DEPTHSTENCIL_STATE),
    (GE_CMD_ZTEST, GE_CMD_ZTEST, "ztest", FBC, D::DEPTHSTENCIL_STATE),
    (GE_CMD_BLENDMODE, GE_CMD_BLENDFIXEDB, "blend", FBC, D::BLEND_STATE.union(D::SHADERBLEND)),
    (GE_CMD_DITH0, GE_CMD_DITH3, "dither", FBC, D::RASTER_STATE),
    (GE_CMD_LOGICOP, GE_CMD_LOGICOP, "logicop", FBC, D::BLEND_STATE),
    (GE_CMD_ZWRITEDISABLE, GE_CMD_ZWRITEDISABLE, "zwritedisable", FBC, D::DEPTHSTENCIL_STATE),
    (GE_CMD_MASKRGB, GE_CMD_MASKALPHA, "mask", FBC, D::COLORWRITEMASK.union(D::BLEND_STATE)),
    (GE_CMD_TRANSFERSTART, GE_CMD_TRANSFERSTART, "transferstart", f(f(FB, X), RPC), D::empty()),
    (GE_CMD_TRANSFERSRCPOS, GE_CMD_TRANSFERDSTPOS, "transferpos", NONE, D::empty()),
    (GE_CMD_TRANSFERSIZE, GE_CMD_TRANSFERSIZE, "transfersize", NONE, D::empty()),
];

/// Light index for the per-light parameter block (0x63..=0x9A).
fn light_of(op: u8) -> u32 {
    // Position, direction and attenuation are xyz triples per light, then
    // one spot exponent and one cutoff per light, then three colors per light.
    let n = (op - GE_CMD_LX0) as u32;
    match n {
        0..=35 => (n % 12) / 3,
        36..=39 => n - 36,
        40..=43 => n - 40,
        _ => (n - 44) / 3,
    }
}

fn handler_for<Ctx: DrawContext>(op: u8) -> Option<CmdHandler<Ctx>> {
    let h: CmdHandler<Ctx> = match op {
        GE_CMD_VADDR => handlers::vaddr::<Ctx>,
        GE_CMD_IADDR => handlers::iaddr::<Ctx>,
        GE_CMD_PRIM => handlers::prim::<Ctx>,
        GE_CMD_BEZIER => handlers::bezier::<Ctx>,
        GE_CMD_SPLINE => handlers::spline::<Ctx>,
        GE_CMD_BOUNDINGBOX => handlers::bounding_box::<Ctx>,
        GE_CMD_JUMP => handlers::jump::<Ctx>,
        GE_CMD_BJUMP => handlers::bjump::<Ctx>,
        GE_CMD_CALL => handlers::call::<Ctx>,
        GE_CMD_RET => handlers::ret::<Ctx>,
        GE_CMD_END => handlers::end::<Ctx>,
        GE_CMD_SIGNAL => handlers::signal::<Ctx>,
        GE_CMD_FINISH => handlers::finish::<Ctx>,
        GE_CMD_VERTEXTYPE => handlers::vertex_type::<Ctx>,
        GE_CMD_OFFSETADDR => handlers::offset_addr::<Ctx>,
        GE_CMD_ORIGIN => handlers::origin::<Ctx>,
        GE_CMD_BONEMATRIXNUMBER => handlers::bone_mtx_num::<Ctx>,
        GE_CMD_BONEMATRIXDATA => handlers::bone_mtx_data::<Ctx>,
        GE_CMD_WORLDMATRIXNUMBER => handlers::world_mtx_num::<Ctx>,
        GE_CMD_WORLDMATRIXDATA => handlers::world_mtx_data::<Ctx>,
        GE_CMD_VIEWMATRIXNUMBER => handlers::view_mtx_num::<Ctx>,
        GE_CMD_VIEWMATRIXDATA => handlers::view_mtx_data::<Ctx>,
        GE_CMD_PROJMATRIXNUMBER => handlers::proj_mtx_num::<Ctx>,
        GE_CMD_PROJMATRIXDATA => handlers::proj_mtx_data::<Ctx>,
        GE_CMD_TGENMATRIXNUMBER => handlers::tgen_mtx_num::<Ctx>,
        GE_CMD_TGENMATRIXDATA => handlers::tgen_mtx_data::<Ctx>,
        GE_CMD_TEXSIZE0 => handlers::tex_size0::<Ctx>,
        GE_CMD_LOADCLUT => handlers::load_clut::<Ctx>,
        GE_CMD_TEXFLUSH => handlers::tex_flush::<Ctx>,
        GE_CMD_TRANSFERSTART => handlers::block_transfer_start::<Ctx>,
        _ => return None,
    };
    Some(h)
}

/// The 256-entry opcode table.
pub struct CommandTable<Ctx: DrawContext> {
    infos: [CommandInfo<Ctx>; 256],
}

impl<Ctx: DrawContext> CommandTable<Ctx> {
    pub fn new() -> Self {
        let mut infos = [CommandInfo::UNKNOWN; 256];
        for &(first, last, name, flags, dirty) in ENTRIES {
            for op in first..=last {
                let dirty = if op >= GE_CMD_LX0 && op <= GE_CMD_LSC3 {
                    D::light(light_of(op))
                } else {
                    dirty
                };
                let mut flags = flags;
                if !dirty.is_empty() {
                    flags |= CommandFlags::DIRTY_ON_CHANGE;
                }
                infos[op as usize] = CommandInfo {
                    name,
                    flags,
                    dirty,
                    handler: handler_for::<Ctx>(op),
                };
            }
        }
        Self { infos }
    }

    /// Patch entries for runtime features.
    pub fn apply_features(&mut self, config: &GpuConfig) {
        let vtype = &mut self.infos[GE_CMD_VERTEXTYPE as usize];
        if config.software_skinning {
            // Weight count changes are absorbed by CPU skinning; the handler
            // decides whether to flush.
            vtype.handler = Some(handlers::vertex_type_skinning::<Ctx>);
            vtype.flags.remove(CommandFlags::FLUSH_BEFORE_ON_CHANGE);
        } else {
            vtype.handler = Some(handlers::vertex_type::<Ctx>);
            vtype.flags.insert(CommandFlags::FLUSH_BEFORE_ON_CHANGE);
        }
    }

    #[inline]
    pub fn get(&self, op: u8) -> &CommandInfo<Ctx> {
        &self.infos[op as usize]
    }

    pub fn name(&self, op: u8) -> &'static str {
        self.infos[op as usize].name
    }

    pub fn known_count(&self) -> usize {
        self.infos.iter().filter(|i| i.is_known()).count()
    }
}

impl<Ctx: DrawContext> Default for CommandTable<Ctx> {
    fn default() -> Self {
        Self::new()
    }
}

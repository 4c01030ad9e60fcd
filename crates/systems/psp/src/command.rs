//! GE command words and opcode numbers.
//!
//! A command word is 32 bits: the opcode in bits 31..24 and a 24-bit
//! immediate in bits 23..0. Words are stored little-endian in guest memory.

pub const GE_CMD_NOP: u8 = 0x00;
pub const GE_CMD_VADDR: u8 = 0x01;
pub const GE_CMD_IADDR: u8 = 0x02;
pub const GE_CMD_PRIM: u8 = 0x04;
pub const GE_CMD_BEZIER: u8 = 0x05;
pub const GE_CMD_SPLINE: u8 = 0x06;
pub const GE_CMD_BOUNDINGBOX: u8 = 0x07;
pub const GE_CMD_JUMP: u8 = 0x08;
pub const GE_CMD_BJUMP: u8 = 0x09;
pub const GE_CMD_CALL: u8 = 0x0A;
pub const GE_CMD_RET: u8 = 0x0B;
pub const GE_CMD_END: u8 = 0x0C;
pub const GE_CMD_SIGNAL: u8 = 0x0E;
pub const GE_CMD_FINISH: u8 = 0x0F;
pub const GE_CMD_BASE: u8 = 0x10;
pub const GE_CMD_VERTEXTYPE: u8 = 0x12;
pub const GE_CMD_OFFSETADDR: u8 = 0x13;
pub const GE_CMD_ORIGIN: u8 = 0x14;
pub const GE_CMD_REGION1: u8 = 0x15;
pub const GE_CMD_REGION2: u8 = 0x16;
pub const GE_CMD_LIGHTINGENABLE: u8 = 0x17;
pub const GE_CMD_LIGHTENABLE0: u8 = 0x18;
pub const GE_CMD_LIGHTENABLE3: u8 = 0x1B;
pub const GE_CMD_DEPTHCLAMPENABLE: u8 = 0x1C;
pub const GE_CMD_CULLFACEENABLE: u8 = 0x1D;
pub const GE_CMD_TEXTUREMAPENABLE: u8 = 0x1E;
pub const GE_CMD_FOGENABLE: u8 = 0x1F;
pub const GE_CMD_DITHERENABLE: u8 = 0x20;
pub const GE_CMD_ALPHABLENDENABLE: u8 = 0x21;
pub const GE_CMD_ALPHATESTENABLE: u8 = 0x22;
pub const GE_CMD_ZTESTENABLE: u8 = 0x23;
pub const GE_CMD_STENCILTESTENABLE: u8 = 0x24;
pub const GE_CMD_ANTIALIASENABLE: u8 = 0x25;
pub const GE_CMD_PATCHCULLENABLE: u8 = 0x26;
pub const GE_CMD_COLORTESTENABLE: u8 = 0x27;
pub const GE_CMD_LOGICOPENABLE: u8 = 0x28;
pub const GE_CMD_BONEMATRIXNUMBER: u8 = 0x2A;
pub const GE_CMD_BONEMATRIXDATA: u8 = 0x2B;
pub const GE_CMD_MORPHWEIGHT0: u8 = 0x2C;
pub const GE_CMD_MORPHWEIGHT7: u8 = 0x33;
pub const GE_CMD_PATCHDIVISION: u8 = 0x36;
pub const GE_CMD_PATCHPRIMITIVE: u8 = 0x37;
pub const GE_CMD_PATCHFACING: u8 = 0x38;
pub const GE_CMD_WORLDMATRIXNUMBER: u8 = 0x3A;
pub const GE_CMD_WORLDMATRIXDATA: u8 = 0x3B;
pub const GE_CMD_VIEWMATRIXNUMBER: u8 = 0x3C;
pub const GE_CMD_VIEWMATRIXDATA: u8 = 0x3D;
pub const GE_CMD_PROJMATRIXNUMBER: u8 = 0x3E;
pub const GE_CMD_PROJMATRIXDATA: u8 = 0x3F;
pub const GE_CMD_TGENMATRIXNUMBER: u8 = 0x40;
pub const GE_CMD_TGENMATRIXDATA: u8 = 0x41;
pub const GE_CMD_VIEWPORTXSCALE: u8 = 0x42;
pub const GE_CMD_VIEWPORTYSCALE: u8 = 0x43;
pub const GE_CMD_VIEWPORTZSCALE: u8 = 0x44;
pub const GE_CMD_VIEWPORTXCENTER: u8 = 0x45;
pub const GE_CMD_VIEWPORTYCENTER: u8 = 0x46;
pub const GE_CMD_VIEWPORTZCENTER: u8 = 0x47;
pub const GE_CMD_TEXSCALEU: u8 = 0x48;
pub const GE_CMD_TEXSCALEV: u8 = 0x49;
pub const GE_CMD_TEXOFFSETU: u8 = 0x4A;
pub const GE_CMD_TEXOFFSETV: u8 = 0x4B;
pub const GE_CMD_OFFSETX: u8 = 0x4C;
pub const GE_CMD_OFFSETY: u8 = 0x4D;
pub const GE_CMD_SHADEMODE: u8 = 0x50;
pub const GE_CMD_REVERSENORMAL: u8 = 0x51;
pub const GE_CMD_MATERIALUPDATE: u8 = 0x53;
pub const GE_CMD_MATERIALEMISSIVE: u8 = 0x54;
pub const GE_CMD_MATERIALAMBIENT: u8 = 0x55;
pub const GE_CMD_MATERIALDIFFUSE: u8 = 0x56;
pub const GE_CMD_MATERIALSPECULAR: u8 = 0x57;
pub const GE_CMD_MATERIALALPHA: u8 = 0x58;
pub const GE_CMD_MATERIALSPECULARCOEF: u8 = 0x5B;
pub const GE_CMD_AMBIENTCOLOR: u8 = 0x5C;
pub const GE_CMD_AMBIENTALPHA: u8 = 0x5D;
pub const GE_CMD_LIGHTMODE: u8 = 0x5E;
pub const GE_CMD_LIGHTTYPE0: u8 = 0x5F;
pub const GE_CMD_LIGHTTYPE3: u8 = 0x62;
/// First of the per-light position, direction, attenuation and color registers.
pub const GE_CMD_LX0: u8 = 0x63;
pub const GE_CMD_LSC3: u8 = 0x9A;
pub const GE_CMD_CULL: u8 = 0x9B;
pub const GE_CMD_FRAMEBUFPTR: u8 = 0x9C;
pub const GE_CMD_FRAMEBUFWIDTH: u8 = 0x9D;
pub const GE_CMD_ZBUFPTR: u8 = 0x9E;
pub const GE_CMD_ZBUFWIDTH: u8 = 0x9F;
pub const GE_CMD_TEXADDR0: u8 = 0xA0;
pub const GE_CMD_TEXADDR7: u8 = 0xA7;
pub const GE_CMD_TEXBUFWIDTH0: u8 = 0xA8;
pub const GE_CMD_TEXBUFWIDTH7: u8 = 0xAF;
pub const GE_CMD_CLUTADDR: u8 = 0xB0;
pub const GE_CMD_CLUTADDRUPPER: u8 = 0xB1;
pub const GE_CMD_TRANSFERSRC: u8 = 0xB2;
pub const GE_CMD_TRANSFERSRCW: u8 = 0xB3;
pub const GE_CMD_TRANSFERDST: u8 = 0xB4;
pub const GE_CMD_TRANSFERDSTW: u8 = 0xB5;
pub const GE_CMD_TEXSIZE0: u8 = 0xB8;
pub const GE_CMD_TEXSIZE7: u8 = 0xBF;
pub const GE_CMD_TEXMAPMODE: u8 = 0xC0;
pub const GE_CMD_TEXSHADELS: u8 = 0xC1;
pub const GE_CMD_TEXMODE: u8 = 0xC2;
pub const GE_CMD_TEXFORMAT: u8 = 0xC3;
pub const GE_CMD_LOADCLUT: u8 = 0xC4;
pub const GE_CMD_CLUTFORMAT: u8 = 0xC5;
pub const GE_CMD_TEXFILTER: u8 = 0xC6;
pub const GE_CMD_TEXWRAP: u8 = 0xC7;
pub const GE_CMD_TEXLEVEL: u8 = 0xC8;
pub const GE_CMD_TEXFUNC: u8 = 0xC9;
pub const GE_CMD_TEXENVCOLOR: u8 = 0xCA;
pub const GE_CMD_TEXFLUSH: u8 = 0xCB;
pub const GE_CMD_TEXSYNC: u8 = 0xCC;
pub const GE_CMD_FOG1: u8 = 0xCD;
pub const GE_CMD_FOG2: u8 = 0xCE;
pub const GE_CMD_FOGCOLOR: u8 = 0xCF;
pub const GE_CMD_TEXLODSLOPE: u8 = 0xD0;
pub const GE_CMD_FRAMEBUFPIXFORMAT: u8 = 0xD2;
pub const GE_CMD_CLEARMODE: u8 = 0xD3;
pub const GE_CMD_SCISSOR1: u8 = 0xD4;
pub const GE_CMD_SCISSOR2: u8 = 0xD5;
pub const GE_CMD_MINZ: u8 = 0xD6;
pub const GE_CMD_MAXZ: u8 = 0xD7;
pub const GE_CMD_COLORTEST: u8 = 0xD8;
pub const GE_CMD_COLORREF: u8 = 0xD9;
pub const GE_CMD_COLORTESTMASK: u8 = 0xDA;
pub const GE_CMD_ALPHATEST: u8 = 0xDB;
pub const GE_CMD_STENCILTEST: u8 = 0xDC;
pub const GE_CMD_STENCILOP: u8 = 0xDD;
pub const GE_CMD_ZTEST: u8 = 0xDE;
pub const GE_CMD_BLENDMODE: u8 = 0xDF;
pub const GE_CMD_BLENDFIXEDA: u8 = 0xE0;
pub const GE_CMD_BLENDFIXEDB: u8 = 0xE1;
pub const GE_CMD_DITH0: u8 = 0xE2;
pub const GE_CMD_DITH3: u8 = 0xE5;
pub const GE_CMD_LOGICOP: u8 = 0xE6;
pub const GE_CMD_ZWRITEDISABLE: u8 = 0xE7;
pub const GE_CMD_MASKRGB: u8 = 0xE8;
pub const GE_CMD_MASKALPHA: u8 = 0xE9;
pub const GE_CMD_TRANSFERSTART: u8 = 0xEA;
pub const GE_CMD_TRANSFERSRCPOS: u8 = 0xEB;
pub const GE_CMD_TRANSFERDSTPOS: u8 = 0xEC;
pub const GE_CMD_TRANSFERSIZE: u8 = 0xEE;

/// Primitive type 7 repeats the previous primitive type.
pub const GE_PRIM_KEEP_PREVIOUS: u8 = 7;

/// A decoded command word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Command {
    pub opcode: u8,
    /// 24-bit immediate
    pub data: u32,
}

impl Command {
    pub fn new(opcode: u8, data: u32) -> Self {
        Self {
            opcode,
            data: data & 0x00FF_FFFF,
        }
    }

    #[inline]
    pub fn decode(word: u32) -> Self {
        Self {
            opcode: (word >> 24) as u8,
            data: word & 0x00FF_FFFF,
        }
    }

    #[inline]
    pub fn encode(self) -> u32 {
        ((self.opcode as u32) << 24) | (self.data & 0x00FF_FFFF)
    }
}

/// Build a command word.
#[inline]
pub const fn word(opcode: u8, data: u32) -> u32 {
    ((opcode as u32) << 24) | (data & 0x00FF_FFFF)
}

/// The GE stores floats as the top 24 bits of an IEEE single.
#[inline]
pub fn float24(data: u32) -> f32 {
    f32::from_bits((data & 0x00FF_FFFF) << 8)
}

/// Inverse of [`float24`]; the low mantissa byte is dropped.
#[inline]
pub fn to_float24(value: f32) -> u32 {
    value.to_bits() >> 8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_roundtrip() {
        for &w in &[0u32, 0x0400_0003, 0xFFFF_FFFF, 0x12AB_CDEF, GE_CMD_END as u32] {
            assert_eq!(Command::decode(w).encode(), w);
        }
    }

    #[test]
    fn test_command_fields() {
        let c = Command::decode(0x0406_0010);
        assert_eq!(c.opcode, GE_CMD_PRIM);
        assert_eq!(c.data, 0x06_0010);
        assert_eq!(word(GE_CMD_PRIM, 0x06_0010), 0x0406_0010);
    }

    #[test]
    fn test_new_masks_data() {
        assert_eq!(Command::new(GE_CMD_BASE, 0xFF12_3456).data, 0x12_3456);
    }

    #[test]
    fn test_float24() {
        assert_eq!(float24(to_float24(1.0)), 1.0);
        assert_eq!(float24(to_float24(-0.5)), -0.5);
        assert_eq!(float24(to_float24(480.0)), 480.0);
    }
}

use crate::bus::{Bus, BusError};
use crate::csr::{CsrFile, Mode, WriteOp};
use crate::decode::patterns::*;
use crate::decode::{
    bit, bits, c_rs1_l, c_rs1_s, c_rs2_l, c_rs2_s, imm_b, imm_ci, imm_cj, imm_cb, imm_i, imm_j,
    imm_s, imm_u, zcmp_reg_mask, zcmp_s_mapping, zcmp_stack_adj, REG_NAMES,
};
use crate::{Exception, Halt};

// Opcode field (instruction bits [6:2]) of the 32-bit encodings.
const OPC_LOAD: u32 = 0b00_000;
const OPC_CUSTOM0: u32 = 0b00_010;
const OPC_OP_IMM: u32 = 0b00_100;
const OPC_AUIPC: u32 = 0b00_101;
const OPC_STORE: u32 = 0b01_000;
const OPC_AMO: u32 = 0b01_011;
const OPC_OP: u32 = 0b01_100;
const OPC_LUI: u32 = 0b01_101;
const OPC_BRANCH: u32 = 0b11_000;
const OPC_JALR: u32 = 0b11_001;
const OPC_JAL: u32 = 0b11_011;
const OPC_SYSTEM: u32 = 0b11_100;

/// One RV32 hart: integer register file, program counter, LR/SC
/// reservation flag, and the machine-mode CSR file.
///
/// [`step`](Cpu::step) fetches, decodes, and executes a single instruction
/// against the supplied bus. The executor itself never touches
/// architectural state: it produces a tentative `(rd, pc, exception)`
/// outcome which the retire stage at the bottom of `step` applies. That
/// split is what keeps fault semantics honest -- a faulting instruction
/// must not commit its register write, and a trap overrides its PC.
pub struct Cpu {
    pub regs: [u32; 32],
    pub pc: u32,
    load_reserved: bool,
    pub csr: CsrFile,
}

impl Cpu {
    pub fn new(reset_vector: u32) -> Self {
        Self {
            regs: [0; 32],
            pc: reset_vector,
            load_reserved: false,
            csr: CsrFile::new(),
        }
    }

    pub fn read_reg(&self, reg: usize) -> u32 {
        if reg == 0 {
            0
        } else {
            self.regs[reg]
        }
    }

    pub fn write_reg(&mut self, reg: usize, data: u32) {
        if reg != 0 {
            self.regs[reg] = data;
        }
    }

    /// Fetch and execute one instruction.
    ///
    /// Guest exceptions are handled internally by redirecting to the trap
    /// vector; the only error that escapes is the testbench halt request.
    pub fn step<B: Bus>(&mut self, bus: &mut B, trace: bool) -> Result<(), Halt> {
        let mut rd_wdata: Option<u32> = None;
        let mut pc_wdata: Option<u32> = None;
        let mut exception: Option<Exception> = None;
        let mut regnum_rd: usize = 0;

        let pc = self.pc;
        let fetch0 = r16(bus, pc);
        let fetch1 = r16(bus, pc.wrapping_add(2));
        let instr =
            u32::from(fetch0.unwrap_or(0)) | (u32::from(fetch1.unwrap_or(0)) << 16);

        let funct3 = instr >> 12 & 0x7;
        let funct7 = instr >> 25 & 0x7f;

        if fetch0.is_none() || (instr & 0x3 == 0x3 && fetch1.is_none()) {
            exception = Some(Exception::InstrFault);
        } else if instr & 0x3 == 0x3 {
            // 32-bit encodings.
            let regnum_rs1 = (instr >> 15 & 0x1f) as usize;
            let regnum_rs2 = (instr >> 20 & 0x1f) as usize;
            regnum_rd = (instr >> 7 & 0x1f) as usize;
            let rs1 = self.regs[regnum_rs1];
            let rs2 = self.regs[regnum_rs2];

            match instr >> 2 & 0x1f {
                OPC_OP => {
                    if funct7 == 0b00_00000 {
                        rd_wdata = Some(match funct3 {
                            0b000 => rs1.wrapping_add(rs2),
                            0b001 => rs1 << (rs2 & 0x1f),
                            0b010 => u32::from((rs1 as i32) < (rs2 as i32)),
                            0b011 => u32::from(rs1 < rs2),
                            0b100 => rs1 ^ rs2,
                            0b101 => rs1 >> (rs2 & 0x1f),
                            0b110 => rs1 | rs2,
                            _ => rs1 & rs2,
                        });
                    } else if funct7 == 0b00_00001 {
                        rd_wdata = Some(match funct3 {
                            0b000 => (rs1 as i32 as i64).wrapping_mul(rs2 as i32 as i64) as u32,
                            0b001 => {
                                ((rs1 as i32 as i64).wrapping_mul(rs2 as i32 as i64) >> 32) as u32
                            }
                            0b010 => {
                                ((rs1 as i32 as i64).wrapping_mul(i64::from(rs2)) >> 32) as u32
                            }
                            0b011 => ((u64::from(rs1) * u64::from(rs2)) >> 32) as u32,
                            0b100 => {
                                if rs2 == 0 {
                                    u32::MAX
                                } else {
                                    (rs1 as i32).wrapping_div(rs2 as i32) as u32
                                }
                            }
                            0b101 => {
                                if rs2 == 0 {
                                    u32::MAX
                                } else {
                                    rs1 / rs2
                                }
                            }
                            0b110 => {
                                if rs2 == 0 {
                                    rs1
                                } else {
                                    (rs1 as i32).wrapping_rem(rs2 as i32) as u32
                                }
                            }
                            _ => {
                                if rs2 == 0 {
                                    rs1
                                } else {
                                    rs1 % rs2
                                }
                            }
                        });
                    } else if funct7 == 0b01_00000 {
                        match funct3 {
                            0b000 => rd_wdata = Some(rs1.wrapping_sub(rs2)),
                            0b100 => rd_wdata = Some(rs1 ^ !rs2),
                            0b101 => rd_wdata = Some(((rs1 as i32) >> (rs2 & 0x1f)) as u32),
                            0b110 => rd_wdata = Some(rs1 | !rs2),
                            0b111 => rd_wdata = Some(rs1 & !rs2),
                            _ => exception = Some(Exception::Illegal),
                        }
                    } else if BCLR.matches(instr) {
                        rd_wdata = Some(rs1 & !(1 << (rs2 & 0x1f)));
                    } else if BEXT.matches(instr) {
                        rd_wdata = Some(rs1 >> (rs2 & 0x1f) & 0x1);
                    } else if BINV.matches(instr) {
                        rd_wdata = Some(rs1 ^ (1 << (rs2 & 0x1f)));
                    } else if BSET.matches(instr) {
                        rd_wdata = Some(rs1 | (1 << (rs2 & 0x1f)));
                    } else if SH1ADD.matches(instr) {
                        rd_wdata = Some((rs1 << 1).wrapping_add(rs2));
                    } else if SH2ADD.matches(instr) {
                        rd_wdata = Some((rs1 << 2).wrapping_add(rs2));
                    } else if SH3ADD.matches(instr) {
                        rd_wdata = Some((rs1 << 3).wrapping_add(rs2));
                    } else if MAX.matches(instr) {
                        rd_wdata = Some((rs1 as i32).max(rs2 as i32) as u32);
                    } else if MAXU.matches(instr) {
                        rd_wdata = Some(rs1.max(rs2));
                    } else if MIN.matches(instr) {
                        rd_wdata = Some((rs1 as i32).min(rs2 as i32) as u32);
                    } else if MINU.matches(instr) {
                        rd_wdata = Some(rs1.min(rs2));
                    } else if ROR.matches(instr) {
                        rd_wdata = Some(rs1.rotate_right(rs2 & 0x1f));
                    } else if ROL.matches(instr) {
                        rd_wdata = Some(rs1.rotate_left(rs2 & 0x1f));
                    } else if PACK.matches(instr) {
                        rd_wdata = Some((rs1 & 0xffff) | (rs2 << 16));
                    } else if PACKH.matches(instr) {
                        rd_wdata = Some((rs1 & 0xff) | ((rs2 & 0xff) << 8));
                    } else if CLMUL.matches(instr) || CLMULH.matches(instr) || CLMULR.matches(instr)
                    {
                        let mut product: u64 = 0;
                        for i in 0..32 {
                            if rs2 >> i & 0x1 != 0 {
                                product ^= u64::from(rs1) << i;
                            }
                        }
                        rd_wdata = Some(if CLMUL.matches(instr) {
                            product as u32
                        } else if CLMULH.matches(instr) {
                            (product >> 32) as u32
                        } else {
                            (product >> 31) as u32
                        });
                    } else {
                        exception = Some(Exception::Illegal);
                    }
                }

                OPC_OP_IMM => {
                    let imm = imm_i(instr);
                    match funct3 {
                        0b000 => rd_wdata = Some(rs1.wrapping_add(imm)),
                        0b010 => rd_wdata = Some(u32::from((rs1 as i32) < (imm as i32))),
                        0b011 => rd_wdata = Some(u32::from(rs1 < imm)),
                        0b100 => rd_wdata = Some(rs1 ^ imm),
                        0b110 => rd_wdata = Some(rs1 | imm),
                        0b111 => rd_wdata = Some(rs1 & imm),
                        _ => {
                            // funct3 001/101: shifts and the single-source
                            // Zbb/Zbkb group, with the shift amount in the
                            // rs2 field.
                            let shamt = regnum_rs2 as u32;
                            if funct7 == 0b00_00000 && funct3 == 0b001 {
                                rd_wdata = Some(rs1 << shamt);
                            } else if funct7 == 0b00_00000 && funct3 == 0b101 {
                                rd_wdata = Some(rs1 >> shamt);
                            } else if funct7 == 0b01_00000 && funct3 == 0b101 {
                                rd_wdata = Some(((rs1 as i32) >> shamt) as u32);
                            } else if BCLRI.matches(instr) {
                                rd_wdata = Some(rs1 & !(1 << shamt));
                            } else if BINVI.matches(instr) {
                                rd_wdata = Some(rs1 ^ (1 << shamt));
                            } else if BSETI.matches(instr) {
                                rd_wdata = Some(rs1 | (1 << shamt));
                            } else if BEXTI.matches(instr) {
                                rd_wdata = Some(rs1 >> shamt & 0x1);
                            } else if CLZ.matches(instr) {
                                rd_wdata = Some(rs1.leading_zeros());
                            } else if CTZ.matches(instr) {
                                rd_wdata = Some(rs1.trailing_zeros());
                            } else if CPOP.matches(instr) {
                                rd_wdata = Some(rs1.count_ones());
                            } else if SEXT_B.matches(instr) {
                                rd_wdata = Some(rs1 as i8 as i32 as u32);
                            } else if SEXT_H.matches(instr) {
                                rd_wdata = Some(rs1 as i16 as i32 as u32);
                            } else if ZIP.matches(instr) {
                                rd_wdata = Some(zip32(rs1));
                            } else if UNZIP.matches(instr) {
                                rd_wdata = Some(unzip32(rs1));
                            } else if BREV8.matches(instr) {
                                rd_wdata = Some(brev8(rs1));
                            } else if ORC_B.matches(instr) {
                                rd_wdata = Some(orc_b(rs1));
                            } else if REV8.matches(instr) {
                                rd_wdata = Some(rs1.swap_bytes());
                            } else if RORI.matches(instr) {
                                rd_wdata = Some(rs1.rotate_right(shamt));
                            } else {
                                exception = Some(Exception::Illegal);
                            }
                        }
                    }
                }

                OPC_BRANCH => {
                    let target = pc.wrapping_add(imm_b(instr));
                    let taken = match funct3 & 0b110 {
                        0b000 => Some(rs1 == rs2),
                        0b100 => Some((rs1 as i32) < (rs2 as i32)),
                        0b110 => Some(rs1 < rs2),
                        _ => None,
                    };
                    match taken {
                        None => exception = Some(Exception::Illegal),
                        Some(cond) => {
                            if cond != (funct3 & 0b001 != 0) {
                                pc_wdata = Some(target);
                            }
                        }
                    }
                }

                OPC_LOAD => {
                    let load_addr = rs1.wrapping_add(imm_i(instr));
                    let misaligned = load_addr & !(u32::MAX << (funct3 & 0x3)) != 0;
                    if funct3 == 0b011 || funct3 > 0b101 {
                        exception = Some(Exception::Illegal);
                    } else if misaligned {
                        exception = Some(Exception::LoadAlign);
                    } else {
                        let data = match funct3 {
                            0b000 => r8(bus, load_addr).map(|d| d as i8 as i32 as u32),
                            0b001 => r16(bus, load_addr).map(|d| d as i16 as i32 as u32),
                            0b010 => r32(bus, load_addr),
                            0b100 => r8(bus, load_addr).map(u32::from),
                            _ => r16(bus, load_addr).map(u32::from),
                        };
                        match data {
                            Some(data) => rd_wdata = Some(data),
                            None => exception = Some(Exception::LoadFault),
                        }
                    }
                }

                OPC_STORE => {
                    let store_addr = rs1.wrapping_add(imm_s(instr));
                    let misaligned = store_addr & !(u32::MAX << (funct3 & 0x3)) != 0;
                    if funct3 > 0b010 {
                        exception = Some(Exception::Illegal);
                    } else if misaligned {
                        exception = Some(Exception::StoreAlign);
                    } else {
                        let ok = match funct3 {
                            0b000 => w8(bus, store_addr, rs2 as u8)?,
                            0b001 => w16(bus, store_addr, rs2 as u16)?,
                            _ => w32(bus, store_addr, rs2)?,
                        };
                        if !ok {
                            exception = Some(Exception::StoreFault);
                        }
                    }
                }

                OPC_AMO => {
                    if LR_W.matches(instr) {
                        if rs1 & 0x3 != 0 {
                            exception = Some(Exception::LoadAlign);
                        } else {
                            match r32(bus, rs1) {
                                Some(data) => {
                                    rd_wdata = Some(data);
                                    self.load_reserved = true;
                                }
                                None => exception = Some(Exception::LoadFault),
                            }
                        }
                    } else if SC_W.matches(instr) {
                        if rs1 & 0x3 != 0 {
                            exception = Some(Exception::StoreAlign);
                        } else if self.load_reserved {
                            self.load_reserved = false;
                            if w32(bus, rs1, rs2)? {
                                rd_wdata = Some(0);
                            } else {
                                exception = Some(Exception::StoreFault);
                            }
                        } else {
                            rd_wdata = Some(1);
                        }
                    } else if AMOSWAP_W.matches(instr)
                        || AMOADD_W.matches(instr)
                        || AMOXOR_W.matches(instr)
                        || AMOAND_W.matches(instr)
                        || AMOOR_W.matches(instr)
                        || AMOMIN_W.matches(instr)
                        || AMOMAX_W.matches(instr)
                        || AMOMINU_W.matches(instr)
                        || AMOMAXU_W.matches(instr)
                    {
                        if rs1 & 0x3 != 0 {
                            exception = Some(Exception::StoreAlign);
                        } else {
                            match r32(bus, rs1) {
                                // Failed AMO reads are store-class faults.
                                None => exception = Some(Exception::StoreFault),
                                Some(old) => {
                                    let new = if AMOSWAP_W.matches(instr) {
                                        rs2
                                    } else if AMOADD_W.matches(instr) {
                                        old.wrapping_add(rs2)
                                    } else if AMOXOR_W.matches(instr) {
                                        old ^ rs2
                                    } else if AMOAND_W.matches(instr) {
                                        old & rs2
                                    } else if AMOOR_W.matches(instr) {
                                        old | rs2
                                    } else if AMOMIN_W.matches(instr) {
                                        (old as i32).min(rs2 as i32) as u32
                                    } else if AMOMAX_W.matches(instr) {
                                        (old as i32).max(rs2 as i32) as u32
                                    } else if AMOMINU_W.matches(instr) {
                                        old.min(rs2)
                                    } else {
                                        old.max(rs2)
                                    };
                                    if w32(bus, rs1, new)? {
                                        rd_wdata = Some(old);
                                    } else {
                                        exception = Some(Exception::StoreFault);
                                    }
                                }
                            }
                        }
                    } else {
                        exception = Some(Exception::Illegal);
                    }
                }

                OPC_JAL => {
                    rd_wdata = Some(pc.wrapping_add(4));
                    pc_wdata = Some(pc.wrapping_add(imm_j(instr)));
                }

                OPC_JALR => {
                    rd_wdata = Some(pc.wrapping_add(4));
                    pc_wdata = Some(rs1.wrapping_add(imm_i(instr)) & !0x1);
                }

                OPC_LUI => {
                    rd_wdata = Some(imm_u(instr));
                }

                OPC_AUIPC => {
                    rd_wdata = Some(pc.wrapping_add(imm_u(instr)));
                }

                OPC_SYSTEM => {
                    let csr_addr = (instr >> 20) as u16;
                    if (0b001..=0b011).contains(&funct3) {
                        // csrrw/csrrs/csrrc
                        let op = match funct3 {
                            0b001 => WriteOp::Write,
                            0b010 => WriteOp::Set,
                            _ => WriteOp::Clear,
                        };
                        if op != WriteOp::Write || regnum_rd != 0 {
                            match self.csr.read(csr_addr) {
                                Ok(data) => rd_wdata = Some(data),
                                Err(_) => exception = Some(Exception::Illegal),
                            }
                        } else if self.csr.write(csr_addr, rs1, op).is_err() {
                            exception = Some(Exception::Illegal);
                        }
                    } else if (0b101..=0b111).contains(&funct3) {
                        // csrrwi/csrrsi/csrrci
                        let op = match funct3 {
                            0b101 => WriteOp::Write,
                            0b110 => WriteOp::Set,
                            _ => WriteOp::Clear,
                        };
                        let uimm = regnum_rs1 as u32;
                        if op != WriteOp::Write || regnum_rd != 0 {
                            match self.csr.read(csr_addr) {
                                Ok(data) => rd_wdata = Some(data),
                                Err(_) => exception = Some(Exception::Illegal),
                            }
                        }
                        if exception.is_none() && (op == WriteOp::Write || uimm != 0) {
                            if self.csr.write(csr_addr, uimm, op).is_err() {
                                exception = Some(Exception::Illegal);
                            }
                        }
                    } else if MRET.matches(instr) {
                        if self.csr.mode() == Mode::Machine {
                            pc_wdata = Some(self.csr.trap_mret());
                        } else {
                            exception = Some(Exception::Illegal);
                        }
                    } else if ECALL.matches(instr) {
                        exception = Some(match self.csr.mode() {
                            Mode::User => Exception::EcallU,
                            Mode::Machine => Exception::EcallM,
                        });
                    } else if EBREAK.matches(instr) {
                        exception = Some(Exception::Breakpoint);
                    } else {
                        exception = Some(Exception::Illegal);
                    }
                }

                OPC_CUSTOM0 => {
                    if BEXTM.matches(instr) {
                        let size = bits(instr, 28, 26) + 1;
                        rd_wdata = Some(rs1 >> (rs2 & 0x1f) & !(u32::MAX << size));
                    } else if BEXTMI.matches(instr) {
                        let size = bits(instr, 28, 26) + 1;
                        rd_wdata = Some(rs1 >> (regnum_rs2 as u32) & !(u32::MAX << size));
                    } else {
                        exception = Some(Exception::Illegal);
                    }
                }

                _ => exception = Some(Exception::Illegal),
            }
        } else if instr & 0x3 == 0x0 {
            // Compressed quadrant 0.
            if ILLEGAL16.matches(instr) {
                exception = Some(Exception::Illegal);
            } else if C_ADDI4SPN.matches(instr) {
                regnum_rd = c_rs2_s(instr);
                rd_wdata = Some(
                    self.regs[2]
                        .wrapping_add(bits(instr, 12, 11) << 4)
                        .wrapping_add(bits(instr, 10, 7) << 6)
                        .wrapping_add(bit(instr, 6) << 2)
                        .wrapping_add(bit(instr, 5) << 3),
                );
            } else if C_LW.matches(instr) {
                regnum_rd = c_rs2_s(instr);
                let load_addr = self.regs[c_rs1_s(instr)]
                    .wrapping_add(bit(instr, 6) << 2)
                    .wrapping_add(bits(instr, 12, 10) << 3)
                    .wrapping_add(bit(instr, 5) << 6);
                if load_addr & 0x3 != 0 {
                    exception = Some(Exception::LoadAlign);
                } else {
                    match r32(bus, load_addr) {
                        Some(data) => rd_wdata = Some(data),
                        None => exception = Some(Exception::LoadFault),
                    }
                }
            } else if C_SW.matches(instr) {
                let store_addr = self.regs[c_rs1_s(instr)]
                    .wrapping_add(bit(instr, 6) << 2)
                    .wrapping_add(bits(instr, 12, 10) << 3)
                    .wrapping_add(bit(instr, 5) << 6);
                if store_addr & 0x3 != 0 {
                    exception = Some(Exception::StoreAlign);
                } else if !w32(bus, store_addr, self.regs[c_rs2_s(instr)])? {
                    exception = Some(Exception::StoreFault);
                }
            } else {
                exception = Some(Exception::Illegal);
            }
        } else if instr & 0x3 == 0x1 {
            // Compressed quadrant 1.
            if C_ADDI.matches(instr) {
                regnum_rd = c_rs1_l(instr);
                rd_wdata = Some(self.regs[regnum_rd].wrapping_add(imm_ci(instr)));
            } else if C_JAL.matches(instr) {
                pc_wdata = Some(pc.wrapping_add(imm_cj(instr)));
                regnum_rd = 1;
                rd_wdata = Some(pc.wrapping_add(2));
            } else if C_LI.matches(instr) {
                regnum_rd = c_rs1_l(instr);
                rd_wdata = Some(imm_ci(instr));
            } else if C_LUI.matches(instr) {
                regnum_rd = c_rs1_l(instr);
                if regnum_rd == 2 {
                    // rd == sp encodes C.ADDI16SP.
                    rd_wdata = Some(
                        self.regs[2]
                            .wrapping_sub(bit(instr, 12) << 9)
                            .wrapping_add(bit(instr, 6) << 4)
                            .wrapping_add(bit(instr, 5) << 6)
                            .wrapping_add(bits(instr, 4, 3) << 7)
                            .wrapping_add(bit(instr, 2) << 5),
                    );
                } else {
                    rd_wdata =
                        Some((bits(instr, 6, 2) << 12).wrapping_sub(bit(instr, 12) << 17));
                }
            } else if C_SRLI.matches(instr) {
                regnum_rd = c_rs1_s(instr);
                rd_wdata = Some(self.regs[regnum_rd] >> bits(instr, 6, 2));
            } else if C_SRAI.matches(instr) {
                regnum_rd = c_rs1_s(instr);
                rd_wdata = Some(((self.regs[regnum_rd] as i32) >> bits(instr, 6, 2)) as u32);
            } else if C_ANDI.matches(instr) {
                regnum_rd = c_rs1_s(instr);
                rd_wdata = Some(self.regs[regnum_rd] & imm_ci(instr));
            } else if C_SUB.matches(instr) {
                regnum_rd = c_rs1_s(instr);
                rd_wdata = Some(self.regs[c_rs1_s(instr)].wrapping_sub(self.regs[c_rs2_s(instr)]));
            } else if C_XOR.matches(instr) {
                regnum_rd = c_rs1_s(instr);
                rd_wdata = Some(self.regs[c_rs1_s(instr)] ^ self.regs[c_rs2_s(instr)]);
            } else if C_OR.matches(instr) {
                regnum_rd = c_rs1_s(instr);
                rd_wdata = Some(self.regs[c_rs1_s(instr)] | self.regs[c_rs2_s(instr)]);
            } else if C_AND.matches(instr) {
                regnum_rd = c_rs1_s(instr);
                rd_wdata = Some(self.regs[c_rs1_s(instr)] & self.regs[c_rs2_s(instr)]);
            } else if C_J.matches(instr) {
                pc_wdata = Some(pc.wrapping_add(imm_cj(instr)));
            } else if C_BEQZ.matches(instr) {
                if self.regs[c_rs1_s(instr)] == 0 {
                    pc_wdata = Some(pc.wrapping_add(imm_cb(instr)));
                }
            } else if C_BNEZ.matches(instr) {
                if self.regs[c_rs1_s(instr)] != 0 {
                    pc_wdata = Some(pc.wrapping_add(imm_cb(instr)));
                }
            } else {
                exception = Some(Exception::Illegal);
            }
        } else {
            // Compressed quadrant 2.
            if C_SLLI.matches(instr) {
                regnum_rd = c_rs1_l(instr);
                rd_wdata = Some(self.regs[regnum_rd] << bits(instr, 6, 2));
            } else if C_MV.matches(instr) {
                if c_rs2_l(instr) == 0 {
                    // c.jr
                    pc_wdata = Some(self.regs[c_rs1_l(instr)] & !0x1);
                } else {
                    regnum_rd = c_rs1_l(instr);
                    rd_wdata = Some(self.regs[c_rs2_l(instr)]);
                }
            } else if C_ADD.matches(instr) {
                if c_rs2_l(instr) == 0 {
                    if c_rs1_l(instr) == 0 {
                        // c.ebreak
                        exception = Some(Exception::Breakpoint);
                    } else {
                        // c.jalr
                        pc_wdata = Some(self.regs[c_rs1_l(instr)] & !0x1);
                        regnum_rd = 1;
                        rd_wdata = Some(pc.wrapping_add(2));
                    }
                } else {
                    regnum_rd = c_rs1_l(instr);
                    rd_wdata =
                        Some(self.regs[c_rs1_l(instr)].wrapping_add(self.regs[c_rs2_l(instr)]));
                }
            } else if C_LWSP.matches(instr) {
                regnum_rd = c_rs1_l(instr);
                let load_addr = self.regs[2]
                    .wrapping_add(bit(instr, 12) << 5)
                    .wrapping_add(bits(instr, 6, 4) << 2)
                    .wrapping_add(bits(instr, 3, 2) << 6);
                if load_addr & 0x3 != 0 {
                    exception = Some(Exception::LoadAlign);
                } else {
                    match r32(bus, load_addr) {
                        Some(data) => rd_wdata = Some(data),
                        None => exception = Some(Exception::LoadFault),
                    }
                }
            } else if C_SWSP.matches(instr) {
                let store_addr = self.regs[2]
                    .wrapping_add(bits(instr, 12, 9) << 2)
                    .wrapping_add(bits(instr, 8, 7) << 6);
                if store_addr & 0x3 != 0 {
                    exception = Some(Exception::StoreAlign);
                } else if !w32(bus, store_addr, self.regs[c_rs2_l(instr)])? {
                    exception = Some(Exception::StoreFault);
                }
            } else if CM_PUSH.matches(instr) {
                let mask = zcmp_reg_mask(instr);
                let mut addr = self.regs[2];
                let mut failed = false;
                for reg in (1..32).rev() {
                    if mask >> reg & 0x1 != 0 {
                        addr = addr.wrapping_sub(4);
                        if !w32(bus, addr, self.regs[reg])? {
                            failed = true;
                            break;
                        }
                    }
                }
                if failed {
                    exception = Some(Exception::StoreFault);
                } else {
                    regnum_rd = 2;
                    rd_wdata = Some(self.regs[2].wrapping_sub(zcmp_stack_adj(instr)));
                }
            } else if CM_POP.matches(instr) || CM_POPRET.matches(instr) || CM_POPRETZ.matches(instr)
            {
                let clear_a0 = CM_POPRETZ.matches(instr);
                let ret = clear_a0 || CM_POPRET.matches(instr);
                let mask = zcmp_reg_mask(instr);
                let mut addr = self.regs[2].wrapping_add(zcmp_stack_adj(instr));
                // Loads are buffered so a faulting burst leaves every
                // register untouched.
                let mut loaded: Vec<(usize, u32)> = Vec::new();
                let mut failed = false;
                for reg in (1..32).rev() {
                    if mask >> reg & 0x1 != 0 {
                        addr = addr.wrapping_sub(4);
                        match r32(bus, addr) {
                            Some(data) => loaded.push((reg, data)),
                            None => {
                                failed = true;
                                break;
                            }
                        }
                    }
                }
                if failed {
                    exception = Some(Exception::LoadFault);
                } else {
                    for (reg, data) in loaded {
                        self.regs[reg] = data;
                    }
                    if clear_a0 {
                        self.regs[10] = 0;
                    }
                    if ret {
                        pc_wdata = Some(self.regs[1]);
                    }
                    regnum_rd = 2;
                    rd_wdata = Some(self.regs[2].wrapping_add(zcmp_stack_adj(instr)));
                }
            } else if CM_MVSA01.matches(instr) {
                self.regs[zcmp_s_mapping(bits(instr, 9, 7))] = self.regs[10];
                self.regs[zcmp_s_mapping(bits(instr, 4, 2))] = self.regs[11];
            } else if CM_MVA01S.matches(instr) {
                self.regs[10] = self.regs[zcmp_s_mapping(bits(instr, 9, 7))];
                self.regs[11] = self.regs[zcmp_s_mapping(bits(instr, 4, 2))];
            } else {
                exception = Some(Exception::Illegal);
            }
        }

        if trace {
            let instr_field = if instr & 0x3 == 0x3 {
                format!("{:08x}", instr)
            } else {
                format!("    {:04x}", instr & 0xffff)
            };
            let rd_field = match rd_wdata {
                Some(data) if regnum_rd != 0 => {
                    format!("{:<3} <- {:08x} ", REG_NAMES[regnum_rd], data)
                }
                _ => " ".repeat(16),
            };
            match pc_wdata {
                Some(target) => println!("{:08x}: {} : {}: pc <- {:08x}", pc, instr_field, rd_field, target),
                None => println!("{:08x}: {} : {}:", pc, instr_field, rd_field),
            }
        }

        if let Some(cause) = exception {
            let target = self.csr.trap_enter(cause.code(), pc);
            log::debug!(
                "trap: cause {} at pc {:08x}, vectoring to {:08x}",
                cause.code(),
                pc,
                target
            );
            pc_wdata = Some(target);
            // A trapping instruction must not commit its register write.
            rd_wdata = None;
            if trace {
                println!("Trap cause {:2}: pc <- {:08x}", cause.code(), target);
            }
        }

        self.pc = match pc_wdata {
            Some(target) => target,
            None => pc.wrapping_add(if instr & 0x3 == 0x3 { 4 } else { 2 }),
        };
        if let Some(data) = rd_wdata {
            if regnum_rd != 0 {
                self.regs[regnum_rd] = data;
            }
        }
        self.csr.step();
        Ok(())
    }
}

fn r8<B: Bus>(bus: &mut B, addr: u32) -> Option<u8> {
    bus.read8(addr).ok()
}

fn r16<B: Bus>(bus: &mut B, addr: u32) -> Option<u16> {
    bus.read16(addr).ok()
}

fn r32<B: Bus>(bus: &mut B, addr: u32) -> Option<u32> {
    bus.read32(addr).ok()
}

fn w8<B: Bus>(bus: &mut B, addr: u32, data: u8) -> Result<bool, Halt> {
    match bus.write8(addr, data) {
        Ok(()) => Ok(true),
        Err(BusError::Unmapped) => Ok(false),
        Err(BusError::Halt(code)) => Err(Halt(code)),
    }
}

fn w16<B: Bus>(bus: &mut B, addr: u32, data: u16) -> Result<bool, Halt> {
    match bus.write16(addr, data) {
        Ok(()) => Ok(true),
        Err(BusError::Unmapped) => Ok(false),
        Err(BusError::Halt(code)) => Err(Halt(code)),
    }
}

fn w32<B: Bus>(bus: &mut B, addr: u32, data: u32) -> Result<bool, Halt> {
    match bus.write32(addr, data) {
        Ok(()) => Ok(true),
        Err(BusError::Unmapped) => Ok(false),
        Err(BusError::Halt(code)) => Err(Halt(code)),
    }
}

/// Bit-interleave the halves of a word (Zbkb zip).
fn zip32(x: u32) -> u32 {
    let mut out = 0;
    for i in 0..32 {
        if x >> i & 0x1 != 0 {
            out |= 1 << ((i >> 4) | ((i & 0xf) << 1));
        }
    }
    out
}

/// De-interleave a word into its even and odd bits (Zbkb unzip).
fn unzip32(x: u32) -> u32 {
    let mut out = 0;
    for i in 0..32 {
        if x >> i & 0x1 != 0 {
            out |= 1 << ((i >> 1) | ((i & 0x1) << 4));
        }
    }
    out
}

/// Reverse the bits within each byte (Zbkb brev8).
fn brev8(x: u32) -> u32 {
    u32::from_le_bytes(x.to_le_bytes().map(|b| b.reverse_bits()))
}

/// OR-reduce each byte to 0x00 or 0xff (Zbb orc.b).
fn orc_b(x: u32) -> u32 {
    u32::from_le_bytes(x.to_le_bytes().map(|b| if b != 0 { 0xff } else { 0 }))
}

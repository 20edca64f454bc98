//! JVM bytecode opcodes understood by the interpreter.

macro_rules! opcodes {
    ($($name:ident = $value:expr,)*) => {
        /// Opcodes are named after their mnemonic in the JVM specification,
        /// see https://en.wikipedia.org/wiki/Java_bytecode_instruction_listings
        #[derive(Debug, Copy, Clone, PartialEq, Eq)]
        #[repr(u8)]
        pub enum OPCode {
            $($name = $value,)*
        }

        impl TryFrom<u8> for OPCode {
            type Error = u8;

            fn try_from(byte: u8) -> Result<Self, u8> {
                match byte {
                    $($value => Ok(OPCode::$name),)*
                    other => Err(other),
                }
            }
        }
    };
}

opcodes! {
    IconstM1 = 0x2,
    Iconst0 = 0x3,
    Iconst1 = 0x4,
    Iconst2 = 0x5,
    Iconst3 = 0x6,
    Iconst4 = 0x7,
    Iconst5 = 0x8,
    Lconst0 = 0x9,
    Lconst1 = 0xa,
    BiPush = 0x10,
    SiPush = 0x11,
    Ldc = 0x12,
    Ldc2W = 0x14,
    ILoad = 0x15,
    LLoad = 0x16,
    ALoad = 0x19,
    ILoad0 = 0x1a,
    ILoad1 = 0x1b,
    ILoad2 = 0x1c,
    ILoad3 = 0x1d,
    LLoad0 = 0x1e,
    LLoad1 = 0x1f,
    LLoad2 = 0x20,
    LLoad3 = 0x21,
    ALoad0 = 0x2a,
    ALoad1 = 0x2b,
    ALoad2 = 0x2c,
    ALoad3 = 0x2d,
    IALoad = 0x2e,
    LALoad = 0x2f,
    AALoad = 0x32,
    BALoad = 0x33,
    CALoad = 0x34,
    SALoad = 0x35,
    IStore = 0x36,
    LStore = 0x37,
    AStore = 0x3a,
    IStore0 = 0x3b,
    IStore1 = 0x3c,
    IStore2 = 0x3d,
    IStore3 = 0x3e,
    LStore0 = 0x3f,
    LStore1 = 0x40,
    LStore2 = 0x41,
    LStore3 = 0x42,
    AStore0 = 0x4b,
    AStore1 = 0x4c,
    AStore2 = 0x4d,
    AStore3 = 0x4e,
    IAStore = 0x4f,
    LAStore = 0x50,
    AAStore = 0x53,
    BAStore = 0x54,
    CAStore = 0x55,
    SAStore = 0x56,
    Pop = 0x57,
    Dup = 0x59,
    IAdd = 0x60,
    LAdd = 0x61,
    ISub = 0x64,
    LSub = 0x65,
    IMul = 0x68,
    LMul = 0x69,
    IDiv = 0x6c,
    LDiv = 0x6d,
    IRem = 0x70,
    LRem = 0x71,
    INeg = 0x74,
    IInc = 0x84,
    I2L = 0x85,
    L2I = 0x88,
    LCmp = 0x94,
    IfEq = 0x99,
    IfNe = 0x9a,
    IfLt = 0x9b,
    IfGe = 0x9c,
    IfGt = 0x9d,
    IfLe = 0x9e,
    IfICmpEq = 0x9f,
    IfICmpNe = 0xa0,
    IfICmpLt = 0xa1,
    IfICmpGe = 0xa2,
    IfICmpGt = 0xa3,
    IfICmpLe = 0xa4,
    Goto = 0xa7,
    IReturn = 0xac,
    LReturn = 0xad,
    AReturn = 0xb0,
    Return = 0xb1,
    GetStatic = 0xb2,
    PutStatic = 0xb3,
    GetField = 0xb4,
    PutField = 0xb5,
    InvokeVirtual = 0xb6,
    InvokeSpecial = 0xb7,
    InvokeStatic = 0xb8,
    InvokeDynamic = 0xba,
    New = 0xbb,
    NewArray = 0xbc,
    ANewArray = 0xbd,
    MultiANewArray = 0xc5,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_decode_known_opcodes() {
        assert_eq!(OPCode::try_from(0x2), Ok(OPCode::IconstM1));
        assert_eq!(OPCode::try_from(0x60), Ok(OPCode::IAdd));
        assert_eq!(OPCode::try_from(0xb1), Ok(OPCode::Return));
        assert_eq!(OPCode::try_from(0xc5), Ok(OPCode::MultiANewArray));
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        // athrow is outside the supported instruction set.
        assert_eq!(OPCode::try_from(0xbf), Err(0xbf));
    }
}

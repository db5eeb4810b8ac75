//! ATmega2560 register map: data-space addresses and interrupt vectors.
//!
//! Addresses are data-space addresses (I/O address + 0x20), which is what
//! `LDS`/`STS` use and how the register file is indexed.

// GPIO
pub const PINA: u8 = 0x20;
pub const PORTA: u8 = 0x22;
pub const PINB: u8 = 0x23;
pub const PORTB: u8 = 0x25;
pub const PINC: u8 = 0x26;
pub const PORTC: u8 = 0x28;
pub const PIND: u8 = 0x29;
pub const PORTD: u8 = 0x2B;

// Timer interrupt flags
pub const TIFR0: u8 = 0x35;
pub const TIFR1: u8 = 0x36;
pub const TIFR2: u8 = 0x37;

// EEPROM
pub const EECR: u8 = 0x3F;
pub const EEDR: u8 = 0x40;
pub const EEARL: u8 = 0x41;
pub const EEARH: u8 = 0x42;

pub const GTCCR: u8 = 0x43;
pub const TCCR0B: u8 = 0x45;
pub const TCNT0: u8 = 0x46;

pub const MCUSR: u8 = 0x54;
pub const SPMCSR: u8 = 0x57;
pub const SPL: u8 = 0x5D;
pub const SPH: u8 = 0x5E;
pub const SREG: u8 = 0x5F;

pub const WDTCSR: u8 = 0x60;
pub const TIMSK0: u8 = 0x6E;
pub const TIMSK1: u8 = 0x6F;
pub const TIMSK2: u8 = 0x70;

pub const TCCR1B: u8 = 0x81;
pub const TCNT1L: u8 = 0x84;
pub const TCNT1H: u8 = 0x85;

pub const TCCR2B: u8 = 0xB1;
pub const TCNT2: u8 = 0xB2;
pub const ASSR: u8 = 0xB6;

// USART0
pub const UCSR0A: u8 = 0xC0;
pub const UCSR0B: u8 = 0xC1;
pub const UDR0: u8 = 0xC6;

/// MCUSR reset cause flags.
pub const PORF: u8 = 0x01;
pub const EXTRF: u8 = 0x02;
pub const BORF: u8 = 0x04;
pub const WDRF: u8 = 0x08;

/// GTCCR bits.
pub const TSM: u8 = 0x80;
pub const PSRASY: u8 = 0x02;
pub const PSRSYNC: u8 = 0x01;

/// ASSR.AS2: Timer/Counter2 clocked from the 32.768 kHz crystal.
pub const AS2: u8 = 0x20;

/// SREG.I
pub const SREG_I: u8 = 0x80;

// Interrupt vectors (word addresses)
pub const WDT_VECTOR: u16 = 0x18;
pub const TIMER2_OVF_VECTOR: u16 = 0x1E;
pub const TIMER1_OVF_VECTOR: u16 = 0x28;
pub const TIMER0_OVF_VECTOR: u16 = 0x2E;
pub const USART0_RX_VECTOR: u16 = 0x32;
pub const USART0_UDRE_VECTOR: u16 = 0x34;
pub const USART0_TX_VECTOR: u16 = 0x36;
pub const EE_READY_VECTOR: u16 = 0x3C;

/// On-chip EEPROM capacity.
pub const EEPROM_SIZE: usize = 4096;
/// System clock the timings assume.
pub const CLOCK_HZ: u64 = 16_000_000;

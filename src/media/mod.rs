pub mod codecs;
pub mod dtmf;

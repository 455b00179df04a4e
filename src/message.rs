/// A marshalled message body together with its signature.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Message {
    pub data: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Message {
    pub fn signature_str(&self) -> &str {
        std::str::from_utf8(&self.signature).unwrap_or("")
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Effect {
    SaveState,
}

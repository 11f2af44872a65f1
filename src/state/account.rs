use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

use crate::common::{Addr, Hash, NullableAddr, NullableHash, Wei};
use crate::core::abi::ContractAbi;

/// An account as stored in the account trie. Contracts additionally carry their code hash,
/// storage root, creator and ABI.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Account {
    pub nonce: u64,
    pub balance: Wei,
    pub created_by: Option<Addr>,
    pub code_hash: Option<Hash>,
    pub storage_root: Option<Hash>,
    pub abi: Vec<ContractAbi>,
}

impl Account {
    pub fn is_contract(&self) -> bool {
        self.code_hash.is_some()
    }

    /// Indistinguishable from an account that was never touched.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

impl Encodable for Account {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(6)
            .append(&self.nonce)
            .append(&self.balance)
            .append(&NullableAddr(self.created_by.clone()))
            .append(&NullableHash(self.code_hash.clone()))
            .append(&NullableHash(self.storage_root.clone()))
            .append_list::<ContractAbi, _>(&self.abi);
    }
}

impl Decodable for Account {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 6 {
            return Err(DecoderError::RlpIncorrectListLen)
        }
        Ok(Self {
            nonce: rlp.val_at(0)?,
            balance: rlp.val_at(1)?,
            created_by: rlp.val_at::<NullableAddr>(2)?.0,
            code_hash: rlp.val_at::<NullableHash>(3)?.0,
            storage_root: rlp.val_at::<NullableHash>(4)?.0,
            abi: rlp.list_at(5)?,
        })
    }
}

#[test]
fn test_account_rlp() {
    use crate::core::abi::AbiType;
    let plain = Account {
        nonce: 3,
        balance: 100.into(),
        ..Default::default()
    };
    let decoded: Account = rlp::decode(&rlp::encode(&plain)).unwrap();
    assert_eq!(decoded, plain);
    assert!(!decoded.is_contract());

    let contract = Account {
        nonce: 1,
        balance: Wei::zero().clone(),
        created_by: Some(Addr::from(9)),
        code_hash: Some(Hash::hash(b"code")),
        storage_root: None,
        abi: vec![ContractAbi::function("get", vec![], vec![AbiType::U64])],
    };
    let decoded: Account = rlp::decode(&rlp::encode(&contract)).unwrap();
    assert_eq!(decoded, contract);
    assert!(decoded.is_contract());
    assert!(Account::default().is_empty());
    assert!(!contract.is_empty());
}
